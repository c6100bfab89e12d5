//! WGSL templates for elementwise kernels.
//!
//! Every kernel shares one binding layout:
//! - binding 0: `params: array<u32>`, `params[0]` is the element count
//! - bindings 1..=arity: read-only `array<f32>` inputs
//! - binding arity + 1: read-write `array<f32>` output
//!
//! The workgroup size is left as the `WORKGROUP_SIZE` shader def and filled
//! in by naga_oil at compile time.

use tessera_core::{BinaryOp, ElementwiseOp, UnaryOp};

/// Name of the shader def holding the workgroup size.
pub const WORKGROUP_SIZE_DEF: &str = "WORKGROUP_SIZE";

/// Entry point of every generated kernel.
pub const ENTRY_POINT: &str = "main";

const ELEMENTWISE_TEMPLATE: &str = r#"// Generated elementwise kernel: $LABEL
@group(0) @binding(0) var<storage, read> params: array<u32>;
$INPUTS
@group(0) @binding($OUTPUT_BINDING) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(#{WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= params[0]) {
        return;
    }
$LOADS
    output[i] = $EXPR;
}
"#;

/// WGSL expression for a unary op over the local `x`.
fn unary_expr(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Exp => "exp(x)",
        UnaryOp::Log => "log(x)",
        UnaryOp::Sqrt => "sqrt(x)",
        UnaryOp::Abs => "abs(x)",
        UnaryOp::Sin => "sin(x)",
        UnaryOp::Cos => "cos(x)",
        UnaryOp::Tan => "tan(x)",
        UnaryOp::Tanh => "tanh(x)",
        UnaryOp::Sigmoid => "1.0 / (1.0 + exp(-x))",
        UnaryOp::Round => "round(x)",
        UnaryOp::Floor => "floor(x)",
        UnaryOp::Ceil => "ceil(x)",
        UnaryOp::Sign => "sign(x)",
    }
}

/// WGSL expression for a binary op over the locals `a` and `b`.
fn binary_expr(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "a + b",
        BinaryOp::Sub => "a - b",
        BinaryOp::Mul => "a * b",
        BinaryOp::Div => "a / b",
        BinaryOp::Max => "max(a, b)",
        BinaryOp::Min => "min(a, b)",
        BinaryOp::Pow => "pow(a, b)",
    }
}

/// Render the WGSL source for `op`.
pub fn render_elementwise(label: &str, op: ElementwiseOp) -> String {
    let arity = op.arity();

    let inputs = (0..arity)
        .map(|n| {
            format!(
                "@group(0) @binding({}) var<storage, read> input{n}: array<f32>;",
                n + 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let (loads, expr) = match op {
        ElementwiseOp::Unary(op) => ("    let x = input0[i];".to_string(), unary_expr(op)),
        ElementwiseOp::Binary(op) => (
            "    let a = input0[i];\n    let b = input1[i];".to_string(),
            binary_expr(op),
        ),
    };

    ELEMENTWISE_TEMPLATE
        .replace("$LABEL", label)
        .replace("$INPUTS", &inputs)
        .replace("$OUTPUT_BINDING", &(arity + 1).to_string())
        .replace("$LOADS", &loads)
        .replace("$EXPR", expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_source_layout() {
        let source = render_elementwise("exp_1_wg256", UnaryOp::Exp.into());

        assert!(source.contains("@binding(0) var<storage, read> params"));
        assert!(source.contains("@binding(1) var<storage, read> input0"));
        assert!(source.contains("@binding(2) var<storage, read_write> output"));
        assert!(source.contains("output[i] = exp(x);"));
        assert!(source.contains("#{WORKGROUP_SIZE}"));
        assert!(!source.contains('$'));
    }

    #[test]
    fn test_binary_source_layout() {
        let source = render_elementwise("pow_2_wg64", BinaryOp::Pow.into());

        assert!(source.contains("input0"));
        assert!(source.contains("@binding(2) var<storage, read> input1"));
        assert!(source.contains("@binding(3) var<storage, read_write> output"));
        assert!(source.contains("output[i] = pow(a, b);"));
    }
}
