//! Host-simulated device.
//!
//! `HostBackend` keeps device buffers in host memory and evaluates kernels on
//! the CPU. Kernels still go through the full WGSL generation path, so a run
//! against simulated devices exercises the same code as a run against a GPU.

use super::{BufferId, CompiledKernel, DeviceBackend, KernelArtifact};
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_codegen::GeneratedKernel;
use tessera_core::ElementwiseOp;

#[derive(Debug, Default)]
struct HostMemory {
    next_id: u64,
    buffers: HashMap<BufferId, Vec<f32>>,
    used_bytes: usize,
}

/// A simulated accelerator backed by host memory.
#[derive(Debug)]
pub struct HostBackend {
    ordinal: usize,
    name: String,
    memory_limit: Option<usize>,
    fail_launches: AtomicBool,
    memory: Mutex<HostMemory>,
}

impl HostBackend {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            name: format!("host-sim:{ordinal}"),
            memory_limit: None,
            fail_launches: AtomicBool::new(false),
            memory: Mutex::new(HostMemory::default()),
        }
    }

    /// Cap device memory at `bytes`; allocations beyond it fail.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Make every subsequent launch fail with a kernel failure.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Relaxed);
    }

    /// Bytes currently held by live buffers.
    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostMemory> {
        self.memory.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, data: Vec<f32>) -> Result<BufferId> {
        let bytes = data.len() * std::mem::size_of::<f32>();
        let mut memory = self.lock();
        if let Some(limit) = self.memory_limit
            && memory.used_bytes + bytes > limit
        {
            return Err(RuntimeError::KernelFailure(format!(
                "{}: out of device memory allocating {bytes} bytes ({} of {limit} in use)",
                self.name, memory.used_bytes
            )));
        }
        memory.next_id += 1;
        let id = BufferId(memory.next_id);
        memory.used_bytes += bytes;
        memory.buffers.insert(id, data);
        Ok(id)
    }
}

impl DeviceBackend for HostBackend {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize_thread(&self) -> Result<()> {
        Ok(())
    }

    fn upload(&self, data: &[f32]) -> Result<BufferId> {
        self.insert(data.to_vec())
    }

    fn allocate(&self, elements: usize) -> Result<BufferId> {
        self.insert(vec![0.0; elements])
    }

    fn download(&self, buffer: BufferId) -> Result<Vec<f32>> {
        self.lock().buffers.get(&buffer).cloned().ok_or_else(|| {
            RuntimeError::InvalidState(format!("{}: unknown buffer {buffer}", self.name))
        })
    }

    fn free(&self, buffer: BufferId) -> Result<()> {
        let mut memory = self.lock();
        let data = memory.buffers.remove(&buffer).ok_or_else(|| {
            RuntimeError::InvalidState(format!("{}: double free of {buffer}", self.name))
        })?;
        memory.used_bytes -= data.len() * std::mem::size_of::<f32>();
        Ok(())
    }

    fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    fn compile(&self, kernel: &GeneratedKernel) -> Result<CompiledKernel> {
        Ok(CompiledKernel {
            spec: kernel.spec,
            label: kernel.label.clone(),
            device: self.ordinal,
            artifact: KernelArtifact::Host { op: kernel.spec.op },
        })
    }

    fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[BufferId],
        output: BufferId,
        elements: usize,
    ) -> Result<()> {
        let &KernelArtifact::Host { op } = &kernel.artifact else {
            return Err(RuntimeError::InvalidState(format!(
                "{}: kernel '{}' was not compiled for a host device",
                self.name, kernel.label
            )));
        };
        if self.fail_launches.load(Ordering::Relaxed) {
            return Err(RuntimeError::KernelFailure(format!(
                "{}: launch of '{}' failed",
                self.name, kernel.label
            )));
        }
        if inputs.len() != op.arity() {
            return Err(RuntimeError::KernelFailure(format!(
                "kernel '{}' expects {} inputs, got {}",
                kernel.label,
                op.arity(),
                inputs.len()
            )));
        }

        let mut memory = self.lock();
        let buffers = &memory.buffers;
        let result: Vec<f32> = match op {
            ElementwiseOp::Unary(op) => {
                let x = read_buffer(buffers, inputs[0], elements, &kernel.label)?;
                x.iter().map(|&v| op.apply(v)).collect()
            }
            ElementwiseOp::Binary(op) => {
                let a = read_buffer(buffers, inputs[0], elements, &kernel.label)?;
                let b = read_buffer(buffers, inputs[1], elements, &kernel.label)?;
                a.iter()
                    .zip(b)
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect()
            }
        };

        let out = memory.buffers.get_mut(&output).ok_or_else(|| {
            RuntimeError::KernelFailure(format!(
                "kernel '{}' writes unknown {output}",
                kernel.label
            ))
        })?;
        if out.len() < elements {
            return Err(RuntimeError::KernelFailure(format!(
                "kernel '{}' writes {elements} elements into {output} of length {}",
                kernel.label,
                out.len()
            )));
        }
        out[..elements].copy_from_slice(&result);
        Ok(())
    }
}

/// The first `elements` values of an input buffer.
fn read_buffer<'a>(
    buffers: &'a HashMap<BufferId, Vec<f32>>,
    id: BufferId,
    elements: usize,
    label: &str,
) -> Result<&'a [f32]> {
    let data = buffers
        .get(&id)
        .ok_or_else(|| RuntimeError::KernelFailure(format!("kernel '{label}' reads unknown {id}")))?;
    data.get(..elements).ok_or_else(|| {
        RuntimeError::KernelFailure(format!(
            "kernel '{label}' reads {elements} elements from {id} of length {}",
            data.len()
        ))
    })
}
