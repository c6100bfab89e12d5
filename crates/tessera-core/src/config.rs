//! Per-run configuration.
//!
//! A `RunConfiguration` is resolved once per program run by whatever loads
//! the user's configuration and is read-only to the runtime.

use crate::{Error, Result};

/// Capacity sentinel meaning "every device that can be enumerated".
pub const ALL_DEVICES: i32 = -1;

/// Options recognized by the program executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfiguration {
    /// Run device instructions on an accelerator (requires a device context).
    pub accelerator_enabled: bool,

    /// Maximum concurrently checked-out device contexts per process.
    /// `-1` means all available devices.
    pub max_device_contexts: i32,

    /// Compile kernels just in time through the generated code cache.
    pub codegen_enabled: bool,

    /// Include transfer/allocation counters in the run report.
    pub extra_device_stats: bool,

    /// Include per-opcode kernel timings in the run report.
    pub extra_kernel_stats: bool,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            accelerator_enabled: false,
            max_device_contexts: ALL_DEVICES,
            codegen_enabled: false,
            extra_device_stats: false,
            extra_kernel_stats: false,
        }
    }
}

impl RunConfiguration {
    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.accelerator_enabled = enabled;
        self
    }

    pub fn with_max_device_contexts(mut self, max: i32) -> Self {
        self.max_device_contexts = max;
        self
    }

    pub fn with_codegen(mut self, enabled: bool) -> Self {
        self.codegen_enabled = enabled;
        self
    }

    pub fn with_extra_device_stats(mut self, enabled: bool) -> Self {
        self.extra_device_stats = enabled;
        self
    }

    pub fn with_extra_kernel_stats(mut self, enabled: bool) -> Self {
        self.extra_kernel_stats = enabled;
        self
    }

    /// Check option ranges.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `max_device_contexts` is below `-1`.
    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate()
    }

    /// The pool capacity setting carried by this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_device_contexts: self.max_device_contexts,
        }
    }
}

/// Capacity setting for the device context pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum outstanding checkouts, `-1` for all enumerated devices.
    pub max_device_contexts: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_device_contexts: ALL_DEVICES,
        }
    }
}

impl PoolConfig {
    pub fn new(max_device_contexts: i32) -> Self {
        Self {
            max_device_contexts,
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidConfig`] for values below `-1`.
    pub fn validate(&self) -> Result<()> {
        if self.max_device_contexts < ALL_DEVICES {
            return Err(Error::InvalidConfig(format!(
                "max_device_contexts must be -1 (all devices) or >= 0, got {}",
                self.max_device_contexts
            )));
        }
        Ok(())
    }

    /// Resolve the effective capacity against the number of devices found.
    ///
    /// The capacity never exceeds the number of devices: every checkout is
    /// exclusive use of one physical slot.
    pub fn resolve(&self, available_devices: usize) -> usize {
        match usize::try_from(self.max_device_contexts) {
            Ok(max) => max.min(available_devices),
            Err(_) => available_devices,
        }
    }
}
