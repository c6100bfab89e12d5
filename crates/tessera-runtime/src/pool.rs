//! Device context pool.
//!
//! The pool owns one slot per enumerated device and hands out at most
//! `capacity` contexts at a time. Acquisition never blocks: when nothing is
//! free the caller gets `None` and decides what to do about it.

use crate::device::context::KernelTable;
use crate::device::{DeviceBackend, DeviceContext, GpuBackend, HostBackend};
use crate::error::{Result, RuntimeError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tessera_core::PoolConfig;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    backend: Arc<dyn DeviceBackend>,
    kernels: KernelTable,
    lease: Option<u64>,
}

struct PoolState {
    slots: Vec<Slot>,
    config: PoolConfig,
    capacity: usize,
    outstanding: usize,
    next_lease: u64,
    acquired_total: u64,
    released_total: u64,
}

/// Pool internals shared with outstanding contexts.
pub(crate) struct PoolShared {
    id: u64,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Put a context's device back into its slot.
    pub(crate) fn check_in(&self, ctx: &mut DeviceContext) -> Result<()> {
        let mut state = self.lock();
        let slot = state.slots.get_mut(ctx.slot).ok_or_else(|| {
            RuntimeError::InvalidState(format!("device context refers to unknown slot {}", ctx.slot))
        })?;
        if slot.lease != Some(ctx.lease) {
            return Err(RuntimeError::InvalidState(format!(
                "lease {} on {} is not outstanding",
                ctx.lease,
                slot.backend.name()
            )));
        }
        slot.lease = None;
        slot.kernels = ctx.disown();
        ctx.reset_thread();

        state.outstanding -= 1;
        state.released_total += 1;
        tracing::debug!(
            lease = ctx.lease,
            outstanding = state.outstanding,
            "Released device context"
        );
        Ok(())
    }
}

/// Snapshot of pool occupancy and lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Devices enumerated at construction.
    pub devices: usize,
    /// Effective limit on outstanding contexts.
    pub capacity: usize,
    pub outstanding: usize,
    /// Contexts an `acquire` could hand out right now.
    pub available: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

/// Bounded, process-wide pool of device contexts.
///
/// # Example
/// ```
/// use tessera_core::PoolConfig;
/// use tessera_runtime::DeviceContextPool;
///
/// let pool = DeviceContextPool::simulated(2, PoolConfig::default()).unwrap();
/// let ctx = pool.acquire().expect("a device is free");
/// pool.release(ctx).unwrap();
/// assert_eq!(pool.stats().outstanding, 0);
/// ```
pub struct DeviceContextPool {
    shared: Arc<PoolShared>,
}

impl DeviceContextPool {
    /// Create a pool over `devices`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidState`] if `config` is invalid.
    pub fn new(devices: Vec<Arc<dyn DeviceBackend>>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.resolve(devices.len());
        let slots = devices
            .into_iter()
            .map(|backend| Slot {
                backend,
                kernels: KernelTable::new(),
                lease: None,
            })
            .collect::<Vec<_>>();

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(pool = id, devices = slots.len(), capacity, "Created device context pool");

        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                state: Mutex::new(PoolState {
                    slots,
                    config,
                    capacity,
                    outstanding: 0,
                    next_lease: 0,
                    acquired_total: 0,
                    released_total: 0,
                }),
            }),
        })
    }

    /// A pool of `count` host-simulated devices.
    pub fn simulated(count: usize, config: PoolConfig) -> Result<Self> {
        let devices = (0..count)
            .map(|ordinal| Arc::new(HostBackend::new(ordinal)) as Arc<dyn DeviceBackend>)
            .collect();
        Self::new(devices, config)
    }

    /// A pool over the GPUs wgpu can find. May be empty.
    pub fn discover(config: PoolConfig) -> Result<Self> {
        Self::new(GpuBackend::discover(), config)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn device_count(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// The enumerated devices, in ordinal order.
    pub fn devices(&self) -> Vec<Arc<dyn DeviceBackend>> {
        self.shared
            .lock()
            .slots
            .iter()
            .map(|slot| Arc::clone(&slot.backend))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.lock().config
    }

    /// Change the capacity for subsequent acquisitions.
    ///
    /// Lowering the capacity does not revoke contexts already handed out.
    pub fn set_capacity(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.shared.lock();
        let capacity = config.resolve(state.slots.len());
        if capacity != state.capacity {
            tracing::debug!(from = state.capacity, to = capacity, "Changed pool capacity");
        }
        state.config = config;
        state.capacity = capacity;
        Ok(())
    }

    /// Check out a free device, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<DeviceContext> {
        let mut state = self.shared.lock();
        if state.outstanding >= state.capacity {
            tracing::debug!(
                outstanding = state.outstanding,
                capacity = state.capacity,
                "Device context pool exhausted"
            );
            return None;
        }
        let index = state.slots.iter().position(|slot| slot.lease.is_none())?;

        state.next_lease += 1;
        let lease = state.next_lease;
        state.outstanding += 1;
        state.acquired_total += 1;

        let slot = &mut state.slots[index];
        slot.lease = Some(lease);
        let kernels = std::mem::take(&mut slot.kernels);
        let backend = Arc::clone(&slot.backend);
        tracing::debug!(device = %backend.name(), lease, "Acquired device context");

        Some(DeviceContext::new(
            backend,
            index,
            lease,
            self.shared.id,
            Arc::downgrade(&self.shared),
            kernels,
        ))
    }

    /// Return a context to the pool.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidState`] if `ctx` was not acquired from
    /// this pool. The context then returns to its own pool when dropped.
    pub fn release(&self, mut ctx: DeviceContext) -> Result<()> {
        if ctx.pool_id != self.shared.id {
            return Err(RuntimeError::InvalidState(format!(
                "device context (lease {}) belongs to pool {}, not pool {}",
                ctx.lease, ctx.pool_id, self.shared.id
            )));
        }
        self.shared.check_in(&mut ctx)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let free_slots = state.slots.iter().filter(|s| s.lease.is_none()).count();
        PoolStats {
            devices: state.slots.len(),
            capacity: state.capacity,
            outstanding: state.outstanding,
            available: state
                .capacity
                .saturating_sub(state.outstanding)
                .min(free_slots),
            acquired_total: state.acquired_total,
            released_total: state.released_total,
        }
    }
}

impl std::fmt::Debug for DeviceContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContextPool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}
