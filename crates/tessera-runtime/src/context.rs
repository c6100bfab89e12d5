//! Execution context: the variable table a program runs against.
//!
//! Besides named matrices, the context carries the device context bound for
//! the current run and, when code generation is enabled, a handle to the
//! generated code cache. Instructions never touch device memory directly;
//! they go through [`OperandStager`](crate::OperandStager), which calls the
//! staging methods here.

use crate::codegen_cache::GeneratedCodeCache;
use crate::device::{CompiledKernel, DeviceContext};
use crate::error::{Result, RuntimeError};
use crate::stager::StagedOperand;
use crate::variables::{DeviceResidency, MatrixObject, Superseded};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_codegen::KernelSpec;
use tessera_core::{ElementwiseOp, Matrix, RuntimeMetrics, Shape};

const F32_BYTES: usize = std::mem::size_of::<f32>();

pub struct ExecutionContext {
    variables: HashMap<String, MatrixObject>,
    device: Option<DeviceContext>,
    codegen: Option<Arc<GeneratedCodeCache>>,
    metrics: Arc<RuntimeMetrics>,
}

impl ExecutionContext {
    pub fn new(metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            variables: HashMap::new(),
            device: None,
            codegen: None,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Bind `matrix` to `name`, replacing any previous value.
    pub fn bind_matrix(&mut self, name: impl Into<String>, matrix: Matrix) -> Result<()> {
        let name = name.into();
        if self.variables.get(&name).is_some_and(MatrixObject::is_pinned) {
            return Err(RuntimeError::InvalidState(format!(
                "cannot rebind '{name}' while it is in use"
            )));
        }
        let object = MatrixObject::from_host(matrix.shape(), matrix.into_data());
        if let Some(previous) = self.variables.insert(name, object) {
            self.free_storage(previous)?;
        }
        Ok(())
    }

    /// Host copy of the matrix bound to `name`.
    ///
    /// Device-side results are copied back first.
    pub fn matrix(&mut self, name: &str) -> Result<Matrix> {
        self.sync_to_host(name)?;
        let object = self.variable_ref(name)?;
        let data = object.host.clone().ok_or_else(|| {
            RuntimeError::InvalidState(format!("variable '{name}' has no data"))
        })?;
        Ok(Matrix::new(object.shape, data)?)
    }

    pub fn variable(&self, name: &str) -> Option<&MatrixObject> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Names of all bound variables, sorted.
    pub fn variable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn metadata(&self, name: &str) -> Option<Shape> {
        self.variables.get(name).map(|v| v.shape)
    }

    /// Record the shape of `name`, declaring it if needed.
    ///
    /// Changing the shape of an existing variable discards its data.
    pub fn set_metadata(&mut self, name: &str, shape: Shape) -> Result<()> {
        let Some(existing) = self.variables.get(name) else {
            self.variables
                .insert(name.to_string(), MatrixObject::declared(shape));
            return Ok(());
        };
        if existing.shape == shape {
            return Ok(());
        }
        if existing.is_pinned() {
            return Err(RuntimeError::InvalidState(format!(
                "cannot reshape '{name}' from {} to {shape} while it is in use",
                existing.shape
            )));
        }
        if let Some(previous) = self
            .variables
            .insert(name.to_string(), MatrixObject::declared(shape))
        {
            self.free_storage(previous)?;
        }
        Ok(())
    }

    /// Unbind `name`, freeing any device copy.
    pub fn remove_variable(&mut self, name: &str) -> Result<MatrixObject> {
        if self.variable_ref(name)?.is_pinned() {
            return Err(RuntimeError::InvalidState(format!(
                "cannot remove '{name}' while it is in use"
            )));
        }
        let mut object = self
            .variables
            .remove(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;
        let storage = MatrixObject {
            device: object.device.take(),
            retired: std::mem::take(&mut object.retired),
            superseded: object.superseded.take(),
            ..MatrixObject::declared(object.shape)
        };
        self.free_storage(storage)?;
        Ok(object)
    }

    /// Bind a device context for the current run.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidState`] if a context is already bound.
    pub fn bind_device(&mut self, ctx: DeviceContext) -> Result<()> {
        if let Some(bound) = &self.device {
            return Err(RuntimeError::InvalidState(format!(
                "execution context already holds device context {}",
                bound.name()
            )));
        }
        self.device = Some(ctx);
        Ok(())
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Result<&DeviceContext> {
        self.device.as_ref().ok_or_else(no_device)
    }

    pub fn take_device(&mut self) -> Option<DeviceContext> {
        self.device.take()
    }

    pub fn attach_codegen(&mut self, cache: Arc<GeneratedCodeCache>) {
        self.codegen = Some(cache);
    }

    pub fn detach_codegen(&mut self) -> Option<Arc<GeneratedCodeCache>> {
        self.codegen.take()
    }

    pub fn codegen_cache(&self) -> Option<&Arc<GeneratedCodeCache>> {
        self.codegen.as_ref()
    }

    /// Number of variables holding a device buffer.
    pub fn device_resident_count(&self) -> usize {
        self.variables
            .values()
            .filter(|v| v.is_device_resident())
            .count()
    }

    /// Pin `name` for reading, uploading it if it is host-only.
    pub(crate) fn stage_input(&mut self, name: &str) -> Result<StagedOperand> {
        let device = self.device.as_ref().ok_or_else(no_device)?;
        device.ensure_ready()?;
        let object = self
            .variables
            .get_mut(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;

        let buffer = match object.device {
            Some(residency) if residency.device == device.ordinal() => residency.buffer,
            Some(residency) => {
                return Err(RuntimeError::InvalidState(format!(
                    "variable '{name}' is resident on device {}, not {}",
                    residency.device,
                    device.ordinal()
                )));
            }
            None => {
                let data = object.host.as_ref().ok_or_else(|| {
                    RuntimeError::InvalidState(format!("variable '{name}' has no data"))
                })?;
                let buffer = device.backend().upload(data)?;
                self.metrics.record_host_to_device(data.len() * F32_BYTES);
                self.metrics.record_device_allocation();
                object.device = Some(DeviceResidency {
                    device: device.ordinal(),
                    buffer,
                    dirty: false,
                });
                buffer
            }
        };

        object.pins += 1;
        Ok(StagedOperand {
            name: name.to_string(),
            shape: object.shape,
            buffer,
        })
    }

    /// Pin `name` for writing into a freshly allocated device buffer.
    ///
    /// What the variable held before is kept aside until the write is
    /// committed with [`commit_output`](Self::commit_output) or undone with
    /// [`rollback_output`](Self::rollback_output).
    pub(crate) fn stage_output(&mut self, name: &str, shape: Shape) -> Result<StagedOperand> {
        let device = self.device.as_ref().ok_or_else(no_device)?;
        device.ensure_ready()?;

        let buffer = device.backend().allocate(shape.len())?;
        self.metrics.record_device_allocation();

        let object = self
            .variables
            .entry(name.to_string())
            .or_insert_with(|| MatrixObject::declared(shape));
        let previous = object.device.replace(DeviceResidency {
            device: device.ordinal(),
            buffer,
            dirty: true,
        });
        let host = object.host.take();
        let previous_shape = std::mem::replace(&mut object.shape, shape);
        object.pins += 1;

        if object.superseded.is_some() {
            // written twice by one instruction; the first write is garbage
            object.retired.extend(previous.map(|r| r.buffer));
        } else {
            object.superseded = Some(Superseded {
                shape: previous_shape,
                host,
                device: previous,
            });
        }

        Ok(StagedOperand {
            name: name.to_string(),
            shape,
            buffer,
        })
    }

    /// Keep the buffer written under `name` and drop what it replaced.
    ///
    /// A replaced buffer still pinned by a reader is freed on its last
    /// unpin.
    pub(crate) fn commit_output(&mut self, name: &str) -> Result<()> {
        let object = self
            .variables
            .get_mut(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;
        let Some(previous) = object.superseded.take().and_then(|s| s.device) else {
            return Ok(());
        };
        if object.pins > 1 {
            object.retired.push(previous.buffer);
            return Ok(());
        }
        let device = self.device.as_ref().ok_or_else(no_device)?;
        device.backend().free(previous.buffer)?;
        self.metrics.record_device_free();
        Ok(())
    }

    /// Discard the buffer written under `name` and restore what it replaced.
    pub(crate) fn rollback_output(&mut self, name: &str) -> Result<()> {
        let object = self
            .variables
            .get_mut(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;
        let Some(superseded) = object.superseded.take() else {
            return Ok(());
        };
        let written = std::mem::replace(&mut object.device, superseded.device);
        object.host = superseded.host;
        if object.host.is_some() || object.device.is_some() {
            object.shape = superseded.shape;
        }

        let Some(written) = written else {
            return Ok(());
        };
        let device = self.device.as_ref().ok_or_else(no_device)?;
        device.backend().free(written.buffer)?;
        self.metrics.record_device_free();
        Ok(())
    }

    pub(crate) fn unpin(&mut self, name: &str) -> Result<()> {
        let object = self
            .variables
            .get_mut(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;
        if object.pins == 0 {
            return Err(RuntimeError::InvalidState(format!(
                "variable '{name}' is not pinned"
            )));
        }
        object.pins -= 1;
        if object.pins > 0 || object.retired.is_empty() {
            return Ok(());
        }

        let device = self.device.as_ref().ok_or_else(no_device)?;
        for buffer in std::mem::take(&mut object.retired) {
            device.backend().free(buffer)?;
            self.metrics.record_device_free();
        }
        Ok(())
    }

    /// The kernel to launch for `op` over `elements` outputs.
    ///
    /// With a code cache attached the kernel is specialized for the input
    /// size; otherwise the device's builtin kernel is used.
    pub(crate) fn kernel_for(
        &mut self,
        op: ElementwiseOp,
        elements: usize,
    ) -> Result<Arc<CompiledKernel>> {
        let device = self.device.as_mut().ok_or_else(no_device)?;
        match &self.codegen {
            Some(cache) => {
                let spec = KernelSpec::specialized(op, elements);
                let backend = device.backend();
                cache.get_or_compile(device.ordinal(), &spec, &self.metrics, |generated| {
                    backend.compile(generated)
                })
            }
            None => device.builtin_kernel(op),
        }
    }

    /// Copy device-side results back to the host and free every device
    /// buffer.
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn evict_device_buffers(&mut self) -> Result<usize> {
        let Some(device) = self.device.as_ref() else {
            return Ok(0);
        };
        let backend = device.backend();
        let mut first_error: Option<RuntimeError> = None;
        let mut evicted = 0;

        for (name, object) in self.variables.iter_mut() {
            if object.pins > 0 {
                tracing::warn!(variable = %name, pins = object.pins, "Evicting pinned variable");
                object.pins = 0;
            }
            let superseded = object.superseded.take().and_then(|s| s.device);
            let leftovers = std::mem::take(&mut object.retired)
                .into_iter()
                .chain(superseded.map(|r| r.buffer));
            for buffer in leftovers {
                match backend.free(buffer) {
                    Ok(()) => self.metrics.record_device_free(),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }

            let Some(residency) = object.device.take() else {
                continue;
            };
            if residency.dirty {
                match backend.download(residency.buffer) {
                    Ok(data) => {
                        self.metrics.record_device_to_host(data.len() * F32_BYTES);
                        object.host = Some(data);
                    }
                    Err(e) => {
                        tracing::error!(variable = %name, error = %e, "Failed to copy back device result");
                        first_error.get_or_insert(e);
                    }
                }
            }
            match backend.free(residency.buffer) {
                Ok(()) => {
                    self.metrics.record_device_free();
                    evicted += 1;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::debug!(evicted, "Evicted device buffers");
        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    fn variable_ref(&self, name: &str) -> Result<&MatrixObject> {
        self.variables
            .get(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))
    }

    fn sync_to_host(&mut self, name: &str) -> Result<()> {
        let object = self
            .variables
            .get_mut(name)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))?;
        let Some(residency) = object.device else {
            return Ok(());
        };
        if !residency.dirty {
            return Ok(());
        }
        let device = self.device.as_ref().ok_or_else(no_device)?;
        let data = device.backend().download(residency.buffer)?;
        self.metrics.record_device_to_host(data.len() * F32_BYTES);
        object.host = Some(data);
        object.device = Some(DeviceResidency {
            dirty: false,
            ..residency
        });
        Ok(())
    }

    /// Free the device side of a variable that is no longer bound.
    fn free_storage(&mut self, object: MatrixObject) -> Result<()> {
        let buffers: Vec<_> = object
            .device
            .into_iter()
            .chain(object.superseded.and_then(|s| s.device))
            .map(|r| r.buffer)
            .chain(object.retired)
            .collect();
        if buffers.is_empty() {
            return Ok(());
        }
        let device = self.device.as_ref().ok_or_else(no_device)?;
        for buffer in buffers {
            device.backend().free(buffer)?;
            self.metrics.record_device_free();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("variables", &self.variable_names())
            .field("device", &self.device)
            .field("codegen", &self.codegen.is_some())
            .finish()
    }
}

fn no_device() -> RuntimeError {
    RuntimeError::InvalidState("no device context bound to the execution context".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DeviceContextPool;
    use tessera_core::PoolConfig;

    fn context_with_device(pool: &DeviceContextPool) -> ExecutionContext {
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        let mut ctx = pool.acquire().unwrap();
        ctx.initialize_thread().unwrap();
        ec.bind_device(ctx).unwrap();
        ec
    }

    #[test]
    fn test_stage_input_uploads_once() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let mut ec = context_with_device(&pool);
        ec.bind_matrix("X", Matrix::zeros(Shape::new(2, 2))).unwrap();

        let a = ec.stage_input("X").unwrap();
        let b = ec.stage_input("X").unwrap();
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(ec.variable("X").unwrap().pin_count(), 2);
        assert_eq!(ec.metrics().snapshot().host_to_device_transfers, 1);

        ec.unpin("X").unwrap();
        ec.unpin("X").unwrap();
        assert!(matches!(ec.unpin("X"), Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn test_stage_without_device() {
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        ec.bind_matrix("X", Matrix::zeros(Shape::new(1, 1))).unwrap();
        assert!(matches!(
            ec.stage_input("X"),
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stage_unknown_variable() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let mut ec = context_with_device(&pool);
        assert!(matches!(
            ec.stage_input("missing"),
            Err(RuntimeError::VariableNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_output_over_pinned_input_retires_old_buffer() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let backend = Arc::clone(&pool.devices()[0]);
        let mut ec = context_with_device(&pool);
        ec.bind_matrix("A", Matrix::zeros(Shape::new(2, 2))).unwrap();

        let input = ec.stage_input("A").unwrap();
        let output = ec.stage_output("A", Shape::new(2, 2)).unwrap();
        assert_ne!(input.buffer, output.buffer);
        assert_eq!(backend.live_buffers(), 2);

        ec.commit_output("A").unwrap();
        ec.unpin("A").unwrap();
        assert_eq!(backend.live_buffers(), 2);
        ec.unpin("A").unwrap();
        assert_eq!(backend.live_buffers(), 1);
    }

    #[test]
    fn test_rollback_restores_previous_contents() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let backend = Arc::clone(&pool.devices()[0]);
        let mut ec = context_with_device(&pool);
        ec.bind_matrix("A", Matrix::new(Shape::new(1, 2), vec![3.0, 4.0]).unwrap())
            .unwrap();

        let input = ec.stage_input("A").unwrap();
        ec.stage_output("A", Shape::new(1, 2)).unwrap();
        assert!(!ec.variable("A").unwrap().has_host_data());

        ec.rollback_output("A").unwrap();
        ec.unpin("A").unwrap();
        ec.unpin("A").unwrap();

        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(ec.variable("A").unwrap().residency().unwrap().buffer, input.buffer);
        assert_eq!(ec.matrix("A").unwrap().data(), &[3.0, 4.0]);
        assert_eq!(ec.evict_device_buffers().unwrap(), 1);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_evict_copies_back_dirty_results() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let backend = Arc::clone(&pool.devices()[0]);
        let mut ec = context_with_device(&pool);

        let output = ec.stage_output("Y", Shape::new(1, 3)).unwrap();
        ec.commit_output("Y").unwrap();
        ec.unpin("Y").unwrap();
        assert_eq!(output.shape, Shape::new(1, 3));

        assert_eq!(ec.evict_device_buffers().unwrap(), 1);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(ec.device_resident_count(), 0);

        let y = ec.matrix("Y").unwrap();
        assert_eq!(y.data(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_remove_variable_frees_device_copy() {
        let pool = DeviceContextPool::simulated(1, PoolConfig::default()).unwrap();
        let backend = Arc::clone(&pool.devices()[0]);
        let mut ec = context_with_device(&pool);
        ec.bind_matrix("X", Matrix::zeros(Shape::new(2, 2))).unwrap();
        ec.stage_input("X").unwrap();

        assert!(matches!(
            ec.remove_variable("X"),
            Err(RuntimeError::InvalidState(_))
        ));
        ec.unpin("X").unwrap();

        let removed = ec.remove_variable("X").unwrap();
        assert!(removed.has_host_data());
        assert!(!removed.is_device_resident());
        assert_eq!(backend.live_buffers(), 0);
        assert!(!ec.contains("X"));
    }

    #[test]
    fn test_set_metadata() {
        let mut ec = ExecutionContext::new(Arc::new(RuntimeMetrics::new()));
        ec.set_metadata("Y", Shape::new(3, 4)).unwrap();
        assert_eq!(ec.metadata("Y"), Some(Shape::new(3, 4)));
        assert!(!ec.variable("Y").unwrap().has_host_data());

        ec.bind_matrix("X", Matrix::zeros(Shape::new(1, 2))).unwrap();
        ec.set_metadata("X", Shape::new(2, 2)).unwrap();
        assert!(!ec.variable("X").unwrap().has_host_data());
    }

    #[test]
    fn test_bind_device_twice() {
        let pool = DeviceContextPool::simulated(2, PoolConfig::default()).unwrap();
        let mut ec = context_with_device(&pool);
        let second = pool.acquire().unwrap();
        assert!(matches!(
            ec.bind_device(second),
            Err(RuntimeError::InvalidState(_))
        ));
        // the rejected context went back to the pool on drop
        assert_eq!(pool.stats().outstanding, 1);
    }
}
