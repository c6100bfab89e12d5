//! Device contexts: exclusive, checked-out handles to one device.

use super::{BufferId, CompiledKernel, DeviceBackend};
use crate::error::{Result, RuntimeError};
use crate::pool::PoolShared;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tessera_codegen::KernelSpec;
use tessera_core::ElementwiseOp;

/// Builtin kernels compiled for one device slot.
pub(crate) type KernelTable = HashMap<ElementwiseOp, Arc<CompiledKernel>>;

/// Exclusive handle to one device, checked out of a [`DeviceContextPool`].
///
/// A context is not `Clone`: holding one is holding the device. Return it
/// with [`DeviceContextPool::release`]. A context that is dropped instead
/// finds its way back to its pool on its own.
///
/// [`DeviceContextPool`]: crate::DeviceContextPool
/// [`DeviceContextPool::release`]: crate::DeviceContextPool::release
pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    pub(crate) slot: usize,
    pub(crate) lease: u64,
    pub(crate) pool_id: u64,
    pub(crate) home: Weak<PoolShared>,
    pub(crate) kernels: KernelTable,
    initialized_on: Option<ThreadId>,
}

impl DeviceContext {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        slot: usize,
        lease: u64,
        pool_id: u64,
        home: Weak<PoolShared>,
        kernels: KernelTable,
    ) -> Self {
        Self {
            backend,
            slot,
            lease,
            pool_id,
            home,
            kernels,
            initialized_on: None,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.backend.ordinal()
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Identifier of this checkout, unique within the pool.
    pub fn lease(&self) -> u64 {
        self.lease
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Bind the device to the calling thread.
    ///
    /// Must be called on the thread that will launch kernels, before any
    /// instruction touches the device.
    pub fn initialize_thread(&mut self) -> Result<()> {
        self.backend.initialize_thread()?;
        let thread = std::thread::current().id();
        tracing::debug!(device = %self.name(), ?thread, "Initialized device for thread");
        self.initialized_on = Some(thread);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized_on.is_some()
    }

    /// Check that the device was initialized for the calling thread.
    pub fn ensure_ready(&self) -> Result<()> {
        match self.initialized_on {
            Some(thread) if thread == std::thread::current().id() => Ok(()),
            Some(_) => Err(RuntimeError::InvalidState(format!(
                "device context {} was initialized on another thread",
                self.name()
            ))),
            None => Err(RuntimeError::InvalidState(format!(
                "device context {} used before thread initialization",
                self.name()
            ))),
        }
    }

    /// The builtin kernel for `op`, compiled on first use.
    ///
    /// Builtin kernels belong to the device slot and survive release, so a
    /// later checkout of the same device reuses them.
    pub fn builtin_kernel(&mut self, op: ElementwiseOp) -> Result<Arc<CompiledKernel>> {
        if let Some(kernel) = self.kernels.get(&op) {
            return Ok(Arc::clone(kernel));
        }
        let generated = KernelSpec::builtin(op).compile()?;
        let kernel = Arc::new(self.backend.compile(&generated)?);
        self.kernels.insert(op, Arc::clone(&kernel));
        Ok(kernel)
    }

    /// Launch `kernel` and wait for it to complete.
    pub fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[BufferId],
        output: BufferId,
        elements: usize,
    ) -> Result<()> {
        self.ensure_ready()?;
        if kernel.device != self.ordinal() {
            return Err(RuntimeError::InvalidState(format!(
                "kernel '{}' was compiled for device {}, not {}",
                kernel.label,
                kernel.device,
                self.ordinal()
            )));
        }
        if elements == 0 {
            return Ok(());
        }
        self.backend.launch(kernel, inputs, output, elements)
    }

    pub(crate) fn reset_thread(&mut self) {
        self.initialized_on = None;
    }

    /// Detach from the owning pool so dropping does not return it twice.
    pub(crate) fn disown(&mut self) -> KernelTable {
        self.home = Weak::new();
        std::mem::take(&mut self.kernels)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.name())
            .field("ordinal", &self.ordinal())
            .field("lease", &self.lease)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Some(pool) = self.home.upgrade() {
            tracing::warn!(
                device = %self.name(),
                lease = self.lease,
                "Device context dropped without release, returning it to its pool"
            );
            if let Err(e) = pool.check_in(self) {
                tracing::error!(error = %e, "Failed to return dropped device context");
            }
        }
    }
}
