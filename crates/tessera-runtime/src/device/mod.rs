//! Device backends.
//!
//! A backend owns the memory of one physical (or simulated) accelerator and
//! knows how to turn a [`GeneratedKernel`] into something it can launch. The
//! rest of the runtime only talks to devices through [`DeviceBackend`], so the
//! pool, staging and instruction code are identical for real GPUs and for the
//! host-simulated devices used in tests.

pub(crate) mod context;
pub mod gpu;
pub mod host;

pub use context::DeviceContext;
pub use gpu::GpuBackend;
pub use host::HostBackend;

use crate::error::Result;
use std::fmt;
use tessera_codegen::{GeneratedKernel, KernelSpec};
use tessera_core::ElementwiseOp;

/// Handle to a buffer allocated on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Backend-specific executable form of a kernel.
#[derive(Debug)]
pub enum KernelArtifact {
    /// Evaluated on the host by the simulated backend.
    Host { op: ElementwiseOp },
    /// A wgpu compute pipeline with its bind group layout.
    Gpu {
        pipeline: wgpu::ComputePipeline,
        bind_group_layout: wgpu::BindGroupLayout,
    },
}

/// A kernel ready to launch on the device that compiled it.
#[derive(Debug)]
pub struct CompiledKernel {
    pub spec: KernelSpec,
    pub label: String,
    /// Ordinal of the device the artifact belongs to.
    pub device: usize,
    pub artifact: KernelArtifact,
}

/// One accelerator, as seen by the runtime.
///
/// Buffers hold dense `f32` data. `launch` blocks until the kernel has
/// completed, so a subsequent `download` observes its output.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Stable index of this device within its pool.
    fn ordinal(&self) -> usize;

    /// Human readable device name.
    fn name(&self) -> &str;

    /// Make the device usable from the calling thread.
    fn initialize_thread(&self) -> Result<()>;

    /// Copy `data` into a new device buffer.
    fn upload(&self, data: &[f32]) -> Result<BufferId>;

    /// Allocate an uninitialized buffer of `elements` floats.
    fn allocate(&self, elements: usize) -> Result<BufferId>;

    /// Copy a device buffer back to the host.
    fn download(&self, buffer: BufferId) -> Result<Vec<f32>>;

    fn free(&self, buffer: BufferId) -> Result<()>;

    /// Number of buffers currently allocated.
    fn live_buffers(&self) -> usize;

    /// Prepare a generated kernel for launching on this device.
    fn compile(&self, kernel: &GeneratedKernel) -> Result<CompiledKernel>;

    /// Run `kernel` over `elements` outputs.
    fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[BufferId],
        output: BufferId,
        elements: usize,
    ) -> Result<()>;
}
