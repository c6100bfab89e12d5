//! Operator allow-lists for device instructions.
//!
//! Each instruction variant accepts a closed set of opcodes. Opcode strings
//! come from the compiled program and are validated at dispatch time with
//! `from_opcode`; anything outside the set is an unsupported operator.

use std::fmt;

/// Shape-preserving unary builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Tanh,
    Sigmoid,
    Round,
    Floor,
    Ceil,
    Sign,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 13] = [
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
        UnaryOp::Abs,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tan,
        UnaryOp::Tanh,
        UnaryOp::Sigmoid,
        UnaryOp::Round,
        UnaryOp::Floor,
        UnaryOp::Ceil,
        UnaryOp::Sign,
    ];

    /// Look up an opcode. Returns `None` for opcodes outside this variant.
    pub fn from_opcode(opcode: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.opcode() == opcode)
    }

    /// Program-level opcode string.
    pub fn opcode(self) -> &'static str {
        match self {
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Round => "round",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Sign => "sign",
        }
    }

    /// Evaluate on the host, following the WGSL builtin of the same name.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Round => x.round_ties_even(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Ceil => x.ceil(),
            // WGSL sign(0.0) is 0.0, unlike f32::signum
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Elementwise binary operators over equally shaped matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 7] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Max,
        BinaryOp::Min,
        BinaryOp::Pow,
    ];

    pub fn from_opcode(opcode: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.opcode() == opcode)
    }

    pub fn opcode(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Pow => "^",
        }
    }

    /// Identifier-safe name, used in kernel labels.
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Pow => "pow",
        }
    }

    /// Evaluate on the host.
    ///
    /// `pow` with a negative base is NaN, as with WGSL `pow`; `powf` would
    /// return a finite value for integral exponents.
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Pow if a < 0.0 => f32::NAN,
            BinaryOp::Pow => a.powf(b),
        }
    }
}

/// Any operator a device kernel can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Unary(UnaryOp),
    Binary(BinaryOp),
}

impl ElementwiseOp {
    /// Number of input operands.
    pub fn arity(self) -> usize {
        match self {
            ElementwiseOp::Unary(_) => 1,
            ElementwiseOp::Binary(_) => 2,
        }
    }

    /// Identifier-safe name, used in kernel labels.
    pub fn name(self) -> &'static str {
        match self {
            ElementwiseOp::Unary(op) => op.opcode(),
            ElementwiseOp::Binary(op) => op.name(),
        }
    }

    pub fn opcode(self) -> &'static str {
        match self {
            ElementwiseOp::Unary(op) => op.opcode(),
            ElementwiseOp::Binary(op) => op.opcode(),
        }
    }
}

impl From<UnaryOp> for ElementwiseOp {
    fn from(op: UnaryOp) -> Self {
        ElementwiseOp::Unary(op)
    }
}

impl From<BinaryOp> for ElementwiseOp {
    fn from(op: BinaryOp) -> Self {
        ElementwiseOp::Binary(op)
    }
}

impl fmt::Display for ElementwiseOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode())
    }
}
