//! Matrix variables and their residency.

use crate::device::BufferId;
use tessera_core::Shape;

/// Where a variable's device copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceResidency {
    pub device: usize,
    pub buffer: BufferId,
    /// The device copy is newer than the host copy.
    pub dirty: bool,
}

/// Contents an in-flight write replaced, kept until the write completes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Superseded {
    pub(crate) shape: Shape,
    pub(crate) host: Option<Vec<f32>>,
    pub(crate) device: Option<DeviceResidency>,
}

/// A named matrix operand.
///
/// A variable may hold host data, a device buffer, or both. While an
/// instruction is using it the variable is pinned and its device buffer
/// must not be freed or replaced in place.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixObject {
    pub(crate) shape: Shape,
    pub(crate) host: Option<Vec<f32>>,
    pub(crate) device: Option<DeviceResidency>,
    pub(crate) pins: usize,
    /// Buffers superseded while pinned, freed on the last unpin.
    pub(crate) retired: Vec<BufferId>,
    /// Previous contents while an instruction is writing this variable.
    pub(crate) superseded: Option<Superseded>,
}

impl MatrixObject {
    /// A variable with host data.
    pub fn from_host(shape: Shape, data: Vec<f32>) -> Self {
        Self {
            shape,
            host: Some(data),
            device: None,
            pins: 0,
            retired: Vec::new(),
            superseded: None,
        }
    }

    /// A variable with metadata only.
    pub fn declared(shape: Shape) -> Self {
        Self {
            shape,
            host: None,
            device: None,
            pins: 0,
            retired: Vec::new(),
            superseded: None,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn has_host_data(&self) -> bool {
        self.host.is_some()
    }

    pub fn residency(&self) -> Option<DeviceResidency> {
        self.device
    }

    pub fn is_device_resident(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pin_count(&self) -> usize {
        self.pins
    }
}
