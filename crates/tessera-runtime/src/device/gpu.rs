//! wgpu-backed device.

use super::{BufferId, CompiledKernel, DeviceBackend, KernelArtifact};
use crate::error::{Result, RuntimeError};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tessera_codegen::GeneratedKernel;

/// Largest workgroup count wgpu accepts in one dimension by default.
const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

#[derive(Debug)]
struct GpuBuffer {
    buffer: wgpu::Buffer,
    elements: usize,
}

/// A physical GPU reached through wgpu.
#[derive(Debug)]
pub struct GpuBackend {
    ordinal: usize,
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<BufferId, GpuBuffer>>,
}

impl GpuBackend {
    /// Open a device on `adapter`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::ResourceUnavailable`] if the device cannot be
    /// created.
    pub async fn with_adapter(ordinal: usize, adapter: &wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| {
                RuntimeError::ResourceUnavailable(format!(
                    "Failed to create device on '{}': {e}",
                    info.name
                ))
            })?;

        Ok(Self {
            ordinal,
            name: format!("{} ({:?})", info.name, info.backend),
            device,
            queue,
            next_id: AtomicU64::new(0),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Find the available GPUs.
    ///
    /// wgpu hands out one adapter per request, so at most one device is
    /// returned. An empty list means no adapter was found.
    pub fn discover() -> Vec<Arc<dyn DeviceBackend>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }));

        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(error = %e, "No GPU adapter available");
                return Vec::new();
            }
        };

        match pollster::block_on(Self::with_adapter(0, &adapter)) {
            Ok(backend) => {
                tracing::info!(device = %backend.name, "Discovered GPU");
                vec![Arc::new(backend) as Arc<dyn DeviceBackend>]
            }
            Err(e) => {
                tracing::warn!(error = %e, "GPU adapter found but device creation failed");
                Vec::new()
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BufferId, GpuBuffer>> {
        self.buffers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn create_storage_buffer(&self, elements: usize) -> wgpu::Buffer {
        // wgpu requires buffers to be at least 4 bytes
        let size = (elements * std::mem::size_of::<f32>()).max(4) as u64;
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn register(&self, buffer: wgpu::Buffer, elements: usize) -> BufferId {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(id, GpuBuffer { buffer, elements });
        id
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RuntimeError::KernelFailure(format!("GPU poll failed: {e:?}")))?;
        Ok(())
    }
}

impl DeviceBackend for GpuBackend {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize_thread(&self) -> Result<()> {
        // wgpu devices are usable from any thread
        Ok(())
    }

    fn upload(&self, data: &[f32]) -> Result<BufferId> {
        let buffer = self.create_storage_buffer(data.len());
        if !data.is_empty() {
            self.queue
                .write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(self.register(buffer, data.len()))
    }

    fn allocate(&self, elements: usize) -> Result<BufferId> {
        let buffer = self.create_storage_buffer(elements);
        Ok(self.register(buffer, elements))
    }

    fn download(&self, buffer: BufferId) -> Result<Vec<f32>> {
        let buffers = self.lock();
        let source = buffers
            .get(&buffer)
            .ok_or_else(|| RuntimeError::InvalidState(format!("unknown buffer {buffer}")))?;
        let size = source.buffer.size();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_copy"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        let elements = source.elements;
        drop(buffers);

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle()?;

        receiver
            .recv()
            .map_err(|e| RuntimeError::KernelFailure(format!("Map recv failed: {e}")))?
            .map_err(|e| RuntimeError::KernelFailure(format!("Map failed: {e}")))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();

        Ok(bytes
            .chunks_exact(4)
            .take(elements)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn free(&self, buffer: BufferId) -> Result<()> {
        let entry = self
            .lock()
            .remove(&buffer)
            .ok_or_else(|| RuntimeError::InvalidState(format!("double free of {buffer}")))?;
        entry.buffer.destroy();
        Ok(())
    }

    fn live_buffers(&self) -> usize {
        self.lock().len()
    }

    fn compile(&self, kernel: &GeneratedKernel) -> Result<CompiledKernel> {
        let label = kernel.label.as_str();
        let shader_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Naga(Cow::Owned(kernel.module.clone())),
            });

        let output_binding = kernel.spec.binding_count() - 1;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..kernel.spec.binding_count())
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: binding != output_binding,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("{label}_layout")),
                    entries: &entries,
                });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{label}_pipeline_layout")),
                bind_group_layouts: &[&bind_group_layout],
                immediate_size: 0,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(kernel.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            });

        tracing::debug!(label, device = %self.name, "Created compute pipeline");

        Ok(CompiledKernel {
            spec: kernel.spec,
            label: kernel.label.clone(),
            device: self.ordinal,
            artifact: KernelArtifact::Gpu {
                pipeline,
                bind_group_layout,
            },
        })
    }

    fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[BufferId],
        output: BufferId,
        elements: usize,
    ) -> Result<()> {
        let KernelArtifact::Gpu {
            pipeline,
            bind_group_layout,
        } = &kernel.artifact
        else {
            return Err(RuntimeError::InvalidState(format!(
                "kernel '{}' was not compiled for a GPU device",
                kernel.label
            )));
        };

        let (Ok(element_count), Some(workgroups)) =
            (u32::try_from(elements), kernel.spec.workgroups_for(elements))
        else {
            return Err(RuntimeError::KernelFailure(format!(
                "kernel '{}' cannot index {elements} elements",
                kernel.label
            )));
        };
        if workgroups > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(RuntimeError::KernelFailure(format!(
                "kernel '{}' needs {workgroups} workgroups for {elements} elements",
                kernel.label
            )));
        }

        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("elementwise_params"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue
            .write_buffer(&params, 0, bytemuck::cast_slice(&[element_count]));

        let buffers = self.lock();
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (i, id) in inputs.iter().chain(std::iter::once(&output)).enumerate() {
            let Some(storage) = buffers.get(id) else {
                return Err(RuntimeError::KernelFailure(format!(
                    "kernel '{}' uses unknown {id}",
                    kernel.label
                )));
            };
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: storage.buffer.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}_bind_group", kernel.label)),
            layout: bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&kernel.label),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        drop(buffers);

        self.wait_idle()
    }
}
