//! Kernel specifications and compilation.
//!
//! A `KernelSpec` names what to build (operator + workgroup size). Compiling
//! it renders the WGSL template and runs it through naga_oil, producing a
//! validated `naga::Module` that any backend can turn into an executable
//! artifact.

use crate::error::{CodegenError, Result};
use crate::templates::{self, ENTRY_POINT, WORKGROUP_SIZE_DEF};
use naga_oil::compose::{Composer, NagaModuleDescriptor, ShaderDefValue};
use std::collections::HashMap;
use tessera_core::ElementwiseOp;

/// Workgroup size of the precompiled builtin kernels.
pub const BUILTIN_WORKGROUP_SIZE: u32 = 256;

/// What to compile: an elementwise operator at a given workgroup size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSpec {
    pub op: ElementwiseOp,
    pub workgroup_size: u32,
}

impl KernelSpec {
    /// The generic kernel shipped with every device context.
    pub fn builtin(op: impl Into<ElementwiseOp>) -> Self {
        Self {
            op: op.into(),
            workgroup_size: BUILTIN_WORKGROUP_SIZE,
        }
    }

    /// A kernel specialized for `elements` outputs.
    ///
    /// Small inputs get narrower workgroups so fewer invocations idle.
    pub fn specialized(op: impl Into<ElementwiseOp>, elements: usize) -> Self {
        let workgroup_size = match elements {
            0..=64 => 64,
            65..=128 => 128,
            _ => 256,
        };
        Self {
            op: op.into(),
            workgroup_size,
        }
    }

    /// Cache label, unique per spec.
    pub fn label(&self) -> String {
        format!(
            "{}_{}_wg{}",
            self.op.name(),
            self.op.arity(),
            self.workgroup_size
        )
    }

    /// Number of workgroups needed to cover `elements`, or `None` if the
    /// count does not fit the kernel's `u32` element index.
    pub fn workgroups_for(&self, elements: usize) -> Option<u32> {
        let elements = u32::try_from(elements).ok()?;
        Some(elements.div_ceil(self.workgroup_size))
    }

    /// Total number of bindings (params + inputs + output).
    pub fn binding_count(&self) -> usize {
        self.op.arity() + 2
    }

    /// Render and compile this spec.
    ///
    /// # Errors
    /// Returns [`CodegenError::InvalidWorkgroupSize`] for a zero or
    /// non-power-of-two size and [`CodegenError::ShaderError`] if naga_oil
    /// rejects the generated source.
    pub fn compile(&self) -> Result<GeneratedKernel> {
        if self.workgroup_size == 0 || !self.workgroup_size.is_power_of_two() {
            return Err(CodegenError::InvalidWorkgroupSize(self.workgroup_size));
        }

        let label = self.label();
        let source = templates::render_elementwise(&label, self.op);

        let mut shader_defs = HashMap::new();
        shader_defs.insert(
            WORKGROUP_SIZE_DEF.to_string(),
            ShaderDefValue::UInt(self.workgroup_size),
        );

        let mut composer = Composer::default();
        let module = composer
            .make_naga_module(NagaModuleDescriptor {
                source: &source,
                file_path: &label,
                shader_defs,
                ..Default::default()
            })
            .map_err(|e| {
                CodegenError::ShaderError(format!("Shader compilation failed for '{label}': {e}"))
            })?;

        tracing::debug!(label = %label, "compiled elementwise kernel");

        Ok(GeneratedKernel {
            spec: *self,
            label,
            source,
            module,
        })
    }
}

/// A compiled, validated kernel module.
#[derive(Debug, Clone)]
pub struct GeneratedKernel {
    pub spec: KernelSpec,
    pub label: String,
    /// WGSL before shader-def substitution.
    pub source: String,
    pub module: naga::Module,
}

impl GeneratedKernel {
    pub fn entry_point(&self) -> &'static str {
        ENTRY_POINT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BinaryOp, UnaryOp};

    #[test]
    fn test_labels() {
        assert_eq!(KernelSpec::builtin(UnaryOp::Exp).label(), "exp_1_wg256");
        assert_eq!(
            KernelSpec::specialized(BinaryOp::Add, 12).label(),
            "add_2_wg64"
        );
    }

    #[test]
    fn test_specialized_workgroup_sizes() {
        assert_eq!(KernelSpec::specialized(UnaryOp::Exp, 1).workgroup_size, 64);
        assert_eq!(KernelSpec::specialized(UnaryOp::Exp, 100).workgroup_size, 128);
        assert_eq!(KernelSpec::specialized(UnaryOp::Exp, 10_000).workgroup_size, 256);
    }

    #[test]
    fn test_workgroups_cover_elements() {
        let spec = KernelSpec::builtin(UnaryOp::Exp);
        assert_eq!(spec.workgroups_for(1), Some(1));
        assert_eq!(spec.workgroups_for(256), Some(1));
        assert_eq!(spec.workgroups_for(257), Some(2));
        assert_eq!(spec.workgroups_for(u32::MAX as usize), Some(16_777_216));
        assert_eq!(spec.binding_count(), 3);
        assert_eq!(KernelSpec::builtin(BinaryOp::Mul).binding_count(), 4);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_workgroups_reject_oversized_counts() {
        let spec = KernelSpec::builtin(UnaryOp::Exp);
        assert_eq!(spec.workgroups_for(u32::MAX as usize + 1), None);
        assert_eq!(spec.workgroups_for((1usize << 32) + 256), None);
    }

    #[test]
    fn test_rejects_bad_workgroup_size() {
        let spec = KernelSpec {
            op: UnaryOp::Exp.into(),
            workgroup_size: 100,
        };
        assert!(matches!(
            spec.compile(),
            Err(CodegenError::InvalidWorkgroupSize(100))
        ));
    }

    #[test]
    fn test_every_operator_compiles() {
        for op in UnaryOp::ALL {
            let kernel = KernelSpec::builtin(op)
                .compile()
                .unwrap_or_else(|e| panic!("{} failed: {e}", op.opcode()));
            assert_eq!(kernel.entry_point(), "main");
            assert!(!kernel.module.entry_points.is_empty());
        }
        for op in BinaryOp::ALL {
            let kernel = KernelSpec::specialized(op, 32)
                .compile()
                .unwrap_or_else(|e| panic!("{} failed: {e}", op.opcode()));
            assert_eq!(kernel.spec.workgroup_size, 64);
        }
    }
}
