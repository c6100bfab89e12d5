//! Process-wide cache of generated kernels.
//!
//! Kernels specialized for a run are compiled once per device and shared by
//! every instruction that asks for the same spec. The executor flushes the
//! cache at the end of each codegen-enabled run.
//!
//! `flush` while another run is still compiling into the cache is not
//! coordinated: that run recompiles what it loses.

use crate::device::CompiledKernel;
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tessera_codegen::{GeneratedKernel, KernelSpec};
use tessera_core::RuntimeMetrics;

/// Cache key: device ordinal and kernel label.
type CacheKey = (usize, String);

#[derive(Debug, Default)]
pub struct GeneratedCodeCache {
    kernels: RwLock<HashMap<CacheKey, Arc<CompiledKernel>>>,
}

impl GeneratedCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `spec` for `device`, generating it on a miss.
    ///
    /// `build` turns the generated module into a device artifact; it runs
    /// without the cache lock held.
    pub fn get_or_compile(
        &self,
        device: usize,
        spec: &KernelSpec,
        metrics: &RuntimeMetrics,
        build: impl FnOnce(&GeneratedKernel) -> Result<CompiledKernel>,
    ) -> Result<Arc<CompiledKernel>> {
        let key = (device, spec.label());
        {
            let kernels = self.kernels.read().map_err(|_| poisoned())?;
            if let Some(kernel) = kernels.get(&key) {
                metrics.record_codegen_hit();
                return Ok(Arc::clone(kernel));
            }
        }
        metrics.record_codegen_miss();

        let generated = spec.compile()?;
        let kernel = Arc::new(build(&generated)?);
        metrics.record_codegen_compilation();
        tracing::debug!(device, label = %key.1, "Generated kernel");

        let mut kernels = self.kernels.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(kernels.entry(key).or_insert(kernel)))
    }

    pub fn contains(&self, device: usize, label: &str) -> bool {
        self.kernels
            .read()
            .map(|k| k.contains_key(&(device, label.to_string())))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.kernels.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached kernel, returning how many were evicted.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidState`] if the cache lock is poisoned.
    pub fn flush(&self) -> Result<usize> {
        let mut kernels = self.kernels.write().map_err(|_| poisoned())?;
        let evicted = kernels.len();
        kernels.clear();
        Ok(evicted)
    }
}

fn poisoned() -> RuntimeError {
    RuntimeError::InvalidState("generated code cache lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBackend, HostBackend};
    use tessera_core::{BinaryOp, UnaryOp};

    #[test]
    fn test_hit_after_miss() {
        let cache = GeneratedCodeCache::new();
        let metrics = RuntimeMetrics::new();
        let backend = HostBackend::new(0);
        let spec = KernelSpec::specialized(UnaryOp::Exp, 12);

        let first = cache
            .get_or_compile(0, &spec, &metrics, |g| backend.compile(g))
            .unwrap();
        let second = cache
            .get_or_compile(0, &spec, &metrics, |_| panic!("should be cached"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.contains(0, "exp_1_wg64"));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.codegen_cache_misses, 1);
        assert_eq!(snapshot.codegen_cache_hits, 1);
        assert_eq!(snapshot.codegen_compilations, 1);
    }

    #[test]
    fn test_keyed_per_device() {
        let cache = GeneratedCodeCache::new();
        let metrics = RuntimeMetrics::new();
        let spec = KernelSpec::specialized(BinaryOp::Add, 12);

        for device in 0..2 {
            let backend = HostBackend::new(device);
            cache
                .get_or_compile(device, &spec, &metrics, |g| backend.compile(g))
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_flush_evicts_everything() {
        let cache = GeneratedCodeCache::new();
        let metrics = RuntimeMetrics::new();
        let backend = HostBackend::new(0);
        for op in [UnaryOp::Exp, UnaryOp::Sqrt] {
            cache
                .get_or_compile(0, &KernelSpec::specialized(op, 8), &metrics, |g| {
                    backend.compile(g)
                })
                .unwrap();
        }

        assert_eq!(cache.flush().unwrap(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache = GeneratedCodeCache::new();
        let metrics = RuntimeMetrics::new();
        let spec = KernelSpec::specialized(UnaryOp::Log, 4);

        let result = cache.get_or_compile(0, &spec, &metrics, |_| {
            Err(RuntimeError::KernelFailure("boom".to_string()))
        });
        assert!(matches!(result, Err(RuntimeError::KernelFailure(_))));
        assert!(cache.is_empty());
    }
}
