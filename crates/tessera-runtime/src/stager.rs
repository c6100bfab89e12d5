//! Operand staging for device instructions.
//!
//! An [`OperandStager`] pins the operands of one instruction on the bound
//! device for as long as it lives. Pins are released explicitly with
//! [`OperandStager::release`] on success, which also commits the outputs.
//! If the instruction bails out early the stager's `Drop` rolls the outputs
//! back to their previous contents and releases whatever is still pinned.

use crate::context::ExecutionContext;
use crate::device::{BufferId, CompiledKernel};
use crate::error::Result;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{ElementwiseOp, Shape};

/// An operand pinned on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedOperand {
    pub name: String,
    pub shape: Shape,
    pub buffer: BufferId,
}

pub struct OperandStager<'a> {
    ec: &'a mut ExecutionContext,
    pinned: Vec<String>,
    outputs: Vec<String>,
}

impl<'a> OperandStager<'a> {
    pub fn new(ec: &'a mut ExecutionContext) -> Self {
        Self {
            ec,
            pinned: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Pin `name` for reading, uploading it if needed.
    pub fn input(&mut self, name: &str) -> Result<StagedOperand> {
        let operand = self.ec.stage_input(name)?;
        self.pinned.push(operand.name.clone());
        Ok(operand)
    }

    /// Pin `name` for writing into a new device buffer of `shape`.
    pub fn output(&mut self, name: &str, shape: Shape) -> Result<StagedOperand> {
        let operand = self.ec.stage_output(name, shape)?;
        self.pinned.push(operand.name.clone());
        self.outputs.push(operand.name.clone());
        Ok(operand)
    }

    /// Record the output shape before any device work is done.
    pub fn publish_shape(&mut self, name: &str, shape: Shape) -> Result<()> {
        self.ec.set_metadata(name, shape)
    }

    pub fn kernel(&mut self, op: ElementwiseOp, elements: usize) -> Result<Arc<CompiledKernel>> {
        self.ec.kernel_for(op, elements)
    }

    /// Launch `kernel` over the output's elements and record its timing
    /// under `opcode`.
    pub fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[&StagedOperand],
        output: &StagedOperand,
        opcode: &str,
    ) -> Result<()> {
        let buffers: Vec<BufferId> = inputs.iter().map(|operand| operand.buffer).collect();
        let elements = output.shape.len();

        let started = Instant::now();
        self.ec
            .device()?
            .launch(kernel, &buffers, output.buffer, elements)?;
        let elapsed = started.elapsed();

        self.ec.metrics().record_kernel(opcode, elapsed);
        tracing::trace!(
            kernel = %kernel.label,
            elements,
            elapsed_us = elapsed.as_micros() as u64,
            "Launched kernel"
        );
        Ok(())
    }

    /// Commit the outputs and unpin every staged operand, reporting the
    /// first failure.
    pub fn release(mut self) -> Result<()> {
        let committed = self.finish_outputs(true);
        let released = self.release_pinned();
        committed.and(released)
    }

    fn finish_outputs(&mut self, commit: bool) -> Result<()> {
        let mut first_error = None;
        while let Some(name) = self.outputs.pop() {
            let finished = if commit {
                self.ec.commit_output(&name)
            } else {
                self.ec.rollback_output(&name)
            };
            if let Err(e) = finished {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_pinned(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(name) = self.pinned.pop() {
            if let Err(e) = self.ec.unpin(&name) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for OperandStager<'_> {
    fn drop(&mut self) {
        if !self.outputs.is_empty() {
            if let Err(e) = self.finish_outputs(false) {
                tracing::warn!(error = %e, "Failed to roll back outputs after an instruction error");
            }
        }
        if self.pinned.is_empty() {
            return;
        }
        if let Err(e) = self.release_pinned() {
            tracing::warn!(error = %e, "Failed to release operands after an instruction error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBackend;
    use crate::pool::DeviceContextPool;
    use tessera_core::{Matrix, PoolConfig, RuntimeMetrics, UnaryOp};

    #[test]
    fn test_drop_releases_pins() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        let mut ctx = pool.acquire().unwrap();
        ctx.initialize_thread().unwrap();
        ec.bind_device(ctx).unwrap();
        ec.bind_matrix("X", Matrix::zeros(Shape::new(2, 3))).unwrap();

        {
            let mut stager = OperandStager::new(&mut ec);
            stager.input("X").unwrap();
            stager.output("Y", Shape::new(2, 3)).unwrap();
        }

        assert!(!ec.variable("X").unwrap().is_pinned());
        assert!(!ec.variable("Y").unwrap().is_pinned());
    }

    #[test]
    fn test_drop_restores_overwritten_output() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        let mut ctx = pool.acquire().unwrap();
        ctx.initialize_thread().unwrap();
        ec.bind_device(ctx).unwrap();
        ec.bind_matrix("A", Matrix::new(Shape::new(1, 2), vec![1.0, 2.0]).unwrap())
            .unwrap();

        {
            let mut stager = OperandStager::new(&mut ec);
            stager.input("A").unwrap();
            stager.output("A", Shape::new(1, 2)).unwrap();
        }

        let a = ec.variable("A").unwrap();
        assert!(!a.is_pinned());
        assert!(!a.residency().unwrap().dirty);
        assert_eq!(ec.matrix("A").unwrap().data(), &[1.0, 2.0]);
        assert_eq!(ec.device().unwrap().backend().live_buffers(), 1);
    }

    #[test]
    fn test_staging_requires_bound_device() {
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        ec.bind_matrix("X", Matrix::zeros(Shape::new(1, 1))).unwrap();

        let mut stager = OperandStager::new(&mut ec);
        assert!(matches!(
            stager.input("X"),
            Err(crate::RuntimeError::InvalidState(_))
        ));
        stager.release().unwrap();
        assert!(!ec.variable("X").unwrap().is_pinned());
    }

    #[test]
    fn test_launch_records_kernel_metrics() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        metrics.set_extra_kernel_stats(true);
        let mut ec = ExecutionContext::new(Arc::clone(&metrics));
        let mut ctx = pool.acquire().unwrap();
        ctx.initialize_thread().unwrap();
        ec.bind_device(ctx).unwrap();
        ec.bind_matrix("X", Matrix::from_fn(Shape::new(1, 4), |_, c| c as f32))
            .unwrap();

        let mut stager = OperandStager::new(&mut ec);
        let x = stager.input("X").unwrap();
        let y = stager.output("Y", x.shape).unwrap();
        let kernel = stager.kernel(UnaryOp::Abs.into(), x.shape.len()).unwrap();
        stager.launch(&kernel, &[&x], &y, "abs").unwrap();
        stager.release().unwrap();

        assert_eq!(metrics.snapshot().kernel_launches, 1);
        assert_eq!(metrics.opcode_stats("abs").unwrap().count, 1);
        assert_eq!(ec.matrix("Y").unwrap().data(), &[0.0, 1.0, 2.0, 3.0]);
    }
}
