//! Common test utilities for runtime integration tests.
//!
//! Builds executors over host-simulated devices and the small programs the
//! test files share.

#![allow(dead_code)]

use std::sync::Arc;
use tessera_core::{Matrix, PoolConfig, RunConfiguration, RuntimeMetrics, Shape};
use tessera_runtime::{
    DeviceBackend, DeviceContextPool, ExecutionContext, HostBackend, Instruction,
    InstructionProgram, ProgramExecutor,
};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Executor over `devices` simulated devices with fresh metrics.
pub fn simulated_executor(devices: usize) -> ProgramExecutor {
    let metrics = Arc::new(RuntimeMetrics::new());
    let pool = DeviceContextPool::simulated(devices, PoolConfig::default())
        .expect("Simulated pool should build");
    ProgramExecutor::new(Arc::new(pool), metrics)
}

/// Executor over the given host backends.
pub fn executor_with_backends(backends: Vec<Arc<HostBackend>>) -> ProgramExecutor {
    let devices = backends
        .into_iter()
        .map(|b| b as Arc<dyn DeviceBackend>)
        .collect();
    let pool =
        DeviceContextPool::new(devices, PoolConfig::default()).expect("Pool should build");
    ProgramExecutor::new(Arc::new(pool), Arc::new(RuntimeMetrics::new()))
}

/// Execution context sharing the executor's metrics.
pub fn context_for(executor: &ProgramExecutor) -> ExecutionContext {
    ExecutionContext::new(Arc::clone(executor.metrics()))
}

/// 3x4 matrix holding 0.0, 0.5, 1.0, ... in row-major order.
pub fn ramp_3x4() -> Matrix {
    Matrix::from_fn(Shape::new(3, 4), |r, c| (r * 4 + c) as f32 * 0.5)
}

/// Program with a single unary instruction `output = opcode(input)`.
pub fn unary_program(opcode: &str, input: &str, output: &str) -> InstructionProgram {
    InstructionProgram::new(vec![Instruction::unary(opcode, input, output)])
}

pub fn accelerated() -> RunConfiguration {
    RunConfiguration::default().with_accelerator(true)
}

/// Total live buffers across every device in the executor's pool.
pub fn live_buffers(executor: &ProgramExecutor) -> usize {
    executor
        .pool()
        .devices()
        .iter()
        .map(|d| d.live_buffers())
        .sum()
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= 1e-5 * e.abs().max(1.0),
            "element {i}: expected {e}, got {a}"
        );
    }
}
