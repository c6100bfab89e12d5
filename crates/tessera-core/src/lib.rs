//! Core types shared by every Tessera crate.
//!
//! This crate provides the foundational pieces the runtime is built on:
//! - Matrix shapes and host-resident matrix blocks (`Shape`, `Matrix`)
//! - Per-run configuration (`RunConfiguration`, `PoolConfig`)
//! - Operator allow-lists for device instructions (`UnaryOp`, `BinaryOp`)
//! - Process-visible run statistics (`RuntimeMetrics`)

pub mod config;
pub mod metrics;
pub mod ops;
pub mod shape;

// Re-export commonly used types
pub use config::{PoolConfig, RunConfiguration};
pub use metrics::{MetricsSnapshot, RunTimerToken, RuntimeMetrics};
pub use ops::{BinaryOp, ElementwiseOp, UnaryOp};
pub use shape::{Matrix, Shape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        got: usize,
    },
}
