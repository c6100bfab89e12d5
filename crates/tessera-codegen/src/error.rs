//! Error types for codegen operations.

use thiserror::Error;

/// Result type for codegen operations.
pub type Result<T> = std::result::Result<T, CodegenError>;

/// Errors that can occur during kernel generation.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Invalid workgroup size: {0}")]
    InvalidWorkgroupSize(u32),

    #[error("Shader compilation failed: {0}")]
    ShaderError(String),
}
