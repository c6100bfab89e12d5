//! Program runtime for Tessera.
//!
//! This crate runs programs of elementwise matrix instructions on GPU
//! devices. The pieces, bottom up:
//!
//! - [`DeviceBackend`] implementations: [`GpuBackend`] over wgpu and
//!   [`HostBackend`], a host-memory simulation used for tests and machines
//!   without a GPU.
//! - [`DeviceContextPool`]: a bounded pool of exclusive [`DeviceContext`]s.
//! - [`ExecutionContext`] and [`OperandStager`]: the variable table and the
//!   per-instruction pinning of operands on the bound device.
//! - [`Instruction`]: unary, binary and variable-removal instructions.
//! - [`GeneratedCodeCache`]: kernels specialized for the current run.
//! - [`ProgramExecutor`]: runs a [`Program`] with all of the above set up and
//!   torn down around it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera_core::{Matrix, PoolConfig, RunConfiguration, RuntimeMetrics, Shape};
//! use tessera_runtime::{
//!     DeviceContextPool, ExecutionContext, Instruction, InstructionProgram, ProgramExecutor,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Arc::new(RuntimeMetrics::new());
//! let pool = Arc::new(DeviceContextPool::simulated(2, PoolConfig::default())?);
//! let executor = ProgramExecutor::new(pool, Arc::clone(&metrics));
//!
//! let mut ec = ExecutionContext::new(Arc::clone(&metrics));
//! ec.bind_matrix("X", Matrix::from_fn(Shape::new(2, 2), |r, c| (r + c) as f32))?;
//!
//! let program = InstructionProgram::new(vec![
//!     Instruction::unary("sqrt", "X", "S"),
//!     Instruction::binary("+", "S", "X", "Y"),
//! ]);
//! let config = RunConfiguration::default()
//!     .with_accelerator(true)
//!     .with_codegen(true);
//! executor.run(&program, Some(&mut ec), &config)?;
//!
//! println!("{:?}", ec.matrix("Y")?);
//! # Ok(())
//! # }
//! ```

pub mod codegen_cache;
pub mod context;
pub mod device;
pub mod error;
pub mod executor;
pub mod instruction;
pub mod pool;
pub mod program;
pub mod stager;
pub mod variables;

pub use codegen_cache::GeneratedCodeCache;
pub use context::ExecutionContext;
pub use device::{
    BufferId, CompiledKernel, DeviceBackend, DeviceContext, GpuBackend, HostBackend,
    KernelArtifact,
};
pub use error::{Result, RuntimeError};
pub use executor::ProgramExecutor;
pub use instruction::{
    BinaryInstruction, DeviceInstruction, Instruction, RemoveVariableInstruction,
    UnaryInstruction,
};
pub use pool::{DeviceContextPool, PoolStats};
pub use program::{InstructionProgram, Program};
pub use stager::{OperandStager, StagedOperand};
pub use variables::{DeviceResidency, MatrixObject};
