//! Program executor.
//!
//! [`ProgramExecutor::run`] wraps one program execution with everything the
//! runtime needs around it: statistics toggles, the run timer, a device
//! context checked out of the pool and, for codegen runs, the generated code
//! cache. Teardown is done by guards, so it happens exactly once on every
//! exit path, including errors and panics unwinding through the program.
//!
//! Teardown order is: device buffers evicted and the context released, then
//! the code cache flushed, then the timer stopped and the report produced.

use crate::codegen_cache::GeneratedCodeCache;
use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::pool::DeviceContextPool;
use crate::program::Program;
use std::sync::Arc;
use tessera_core::{RunConfiguration, RunTimerToken, RuntimeMetrics};

/// Runs programs against a device context pool.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use tessera_core::{Matrix, PoolConfig, RunConfiguration, RuntimeMetrics, Shape};
/// use tessera_runtime::{
///     DeviceContextPool, ExecutionContext, Instruction, InstructionProgram, ProgramExecutor,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let metrics = Arc::new(RuntimeMetrics::new());
/// let pool = Arc::new(DeviceContextPool::simulated(1, PoolConfig::default())?);
/// let executor = ProgramExecutor::new(pool, Arc::clone(&metrics));
///
/// let mut ec = ExecutionContext::new(Arc::clone(&metrics));
/// ec.bind_matrix("X", Matrix::zeros(Shape::new(3, 4)))?;
///
/// let program = InstructionProgram::new(vec![Instruction::unary("exp", "X", "Y")]);
/// let config = RunConfiguration::default().with_accelerator(true);
/// executor.run(&program, Some(&mut ec), &config)?;
///
/// assert!(ec.matrix("Y")?.data().iter().all(|&v| v == 1.0));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProgramExecutor {
    pool: Arc<DeviceContextPool>,
    codegen_cache: Arc<GeneratedCodeCache>,
    metrics: Arc<RuntimeMetrics>,
}

impl ProgramExecutor {
    pub fn new(pool: Arc<DeviceContextPool>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            pool,
            codegen_cache: Arc::new(GeneratedCodeCache::new()),
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<DeviceContextPool> {
        &self.pool
    }

    pub fn codegen_cache(&self) -> &Arc<GeneratedCodeCache> {
        &self.codegen_cache
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Execute `program` under `config`.
    ///
    /// With the accelerator enabled a device context is checked out for the
    /// duration of the run and bound to `ec`, which must then be supplied.
    /// Without it instructions are evaluated on the host, and `ec` may be
    /// `None`, in which case the program runs against a scratch context.
    ///
    /// # Errors
    /// - [`RuntimeError::InvalidState`] for an invalid configuration, or when
    ///   the accelerator is enabled without an execution context.
    /// - [`RuntimeError::ResourceUnavailable`] when the pool has no free
    ///   device context.
    /// - Any error raised by the program, unchanged.
    ///
    /// Failures during teardown are logged and never replace the run's
    /// result.
    #[tracing::instrument(
        skip_all,
        fields(
            accelerator = config.accelerator_enabled,
            codegen = config.codegen_enabled
        )
    )]
    pub fn run(
        &self,
        program: &dyn Program,
        ec: Option<&mut ExecutionContext>,
        config: &RunConfiguration,
    ) -> Result<()> {
        config.validate()?;

        self.metrics.set_extra_device_stats(config.extra_device_stats);
        self.metrics.set_extra_kernel_stats(config.extra_kernel_stats);
        self.pool.set_capacity(config.pool_config())?;

        let _timer = RunTimerGuard::start(&self.metrics);
        let _codegen = CodegenFlushGuard {
            cache: &self.codegen_cache,
            metrics: &self.metrics,
            enabled: config.codegen_enabled,
        };

        let result = match ec {
            Some(ec) => self.run_bound(program, ec, config),
            None if config.accelerator_enabled => Err(RuntimeError::InvalidState(
                "accelerator enabled but no execution context supplied".to_string(),
            )),
            None => {
                let mut scratch = ExecutionContext::new(Arc::clone(&self.metrics));
                program.execute(&mut scratch)
            }
        };

        if let Err(e) = &result {
            tracing::warn!(error = %e, "Program run failed");
        }
        result
    }

    fn run_bound(
        &self,
        program: &dyn Program,
        ec: &mut ExecutionContext,
        config: &RunConfiguration,
    ) -> Result<()> {
        let mut binding = DeviceBindingGuard {
            pool: &self.pool,
            ec,
            bound: false,
        };

        if config.accelerator_enabled {
            let mut ctx = self.pool.acquire().ok_or_else(|| {
                let stats = self.pool.stats();
                RuntimeError::ResourceUnavailable(format!(
                    "no device context obtainable: either no device present or all devices in use \
                     ({} of {} in use, {} devices)",
                    stats.outstanding, stats.capacity, stats.devices
                ))
            })?;
            ctx.initialize_thread()?;
            tracing::debug!(device = %ctx.name(), lease = ctx.lease(), "Bound device context");
            binding.ec.bind_device(ctx)?;
            binding.bound = true;

            if config.codegen_enabled {
                binding.ec.attach_codegen(Arc::clone(&self.codegen_cache));
            }
        }

        program.execute(&mut *binding.ec)
    }
}

/// Stops the run timer and produces the statistics report.
struct RunTimerGuard<'a> {
    metrics: &'a RuntimeMetrics,
    token: Option<RunTimerToken>,
}

impl<'a> RunTimerGuard<'a> {
    fn start(metrics: &'a RuntimeMetrics) -> Self {
        Self {
            metrics,
            token: Some(metrics.start_run_timer()),
        }
    }
}

impl Drop for RunTimerGuard<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let elapsed = self.metrics.stop_run_timer(token);
        let report = self.metrics.produce_report();
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{report}");
    }
}

/// Flushes the generated code cache after a codegen run.
struct CodegenFlushGuard<'a> {
    cache: &'a GeneratedCodeCache,
    metrics: &'a RuntimeMetrics,
    enabled: bool,
}

impl Drop for CodegenFlushGuard<'_> {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        match self.cache.flush() {
            Ok(evicted) => {
                self.metrics.record_codegen_flush(evicted);
                tracing::debug!(evicted, "Flushed generated code cache");
            }
            Err(e) => tracing::error!(error = %e, "Failed to flush generated code cache"),
        }
    }
}

/// Returns the run's device context to the pool.
struct DeviceBindingGuard<'a> {
    pool: &'a DeviceContextPool,
    ec: &'a mut ExecutionContext,
    bound: bool,
}

impl Drop for DeviceBindingGuard<'_> {
    fn drop(&mut self) {
        self.ec.detach_codegen();
        if !self.bound {
            return;
        }
        if let Err(e) = self.ec.evict_device_buffers() {
            tracing::error!(error = %e, "Failed to evict device buffers");
        }
        if let Some(ctx) = self.ec.take_device()
            && let Err(e) = self.pool.release(ctx)
        {
            tracing::error!(error = %e, "Failed to release device context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::PoolConfig;

    #[test]
    fn test_guard_order() {
        let metrics = Arc::new(RuntimeMetrics::new());
        let pool = Arc::new(DeviceContextPool::simulated(1, PoolConfig::default()).unwrap());
        let executor = ProgramExecutor::new(Arc::clone(&pool), Arc::clone(&metrics));
        let mut ec = ExecutionContext::new(Arc::clone(&metrics));

        let pool_in_program = Arc::clone(&pool);
        let metrics_in_program = Arc::clone(&metrics);
        let program = move |ec: &mut ExecutionContext| -> Result<()> {
            assert!(ec.has_device());
            assert!(ec.codegen_cache().is_some());
            assert_eq!(pool_in_program.stats().outstanding, 1);
            assert!(metrics_in_program.is_run_timer_running());
            Ok(())
        };

        let config = RunConfiguration::default()
            .with_accelerator(true)
            .with_codegen(true);
        executor.run(&program, Some(&mut ec), &config).unwrap();

        assert!(!ec.has_device());
        assert!(ec.codegen_cache().is_none());
        assert_eq!(pool.stats().outstanding, 0);
        assert!(!metrics.is_run_timer_running());
        assert_eq!(metrics.snapshot().codegen_flushes, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_run() {
        let metrics = Arc::new(RuntimeMetrics::new());
        let pool = Arc::new(DeviceContextPool::simulated(1, PoolConfig::default()).unwrap());
        let executor = ProgramExecutor::new(pool, Arc::clone(&metrics));
        let program = |_: &mut ExecutionContext| -> Result<()> { Ok(()) };

        let config = RunConfiguration::default().with_max_device_contexts(-7);
        assert!(matches!(
            executor.run(&program, None, &config),
            Err(RuntimeError::InvalidState(_))
        ));
        assert_eq!(metrics.snapshot().runs_started, 0);
    }
}
