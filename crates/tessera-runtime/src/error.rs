//! Error types for the runtime crate.

use tessera_codegen::CodegenError;
use thiserror::Error;

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No device context could be obtained when one was required.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// An instruction received an opcode its variant does not implement.
    #[error("Unsupported device operator: {0}")]
    UnsupportedOperator(String),

    /// A kernel, transfer or allocation failed on the device.
    #[error("Kernel failure: {0}")]
    KernelFailure(String),

    /// Misuse of the pool or context protocol.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An operand name is not bound in the execution context.
    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    /// Kernel generation failed.
    #[error("Code generation failed: {0}")]
    Codegen(#[from] CodegenError),
}

impl From<tessera_core::Error> for RuntimeError {
    fn from(err: tessera_core::Error) -> Self {
        match err {
            tessera_core::Error::InvalidConfig(msg) => RuntimeError::InvalidState(msg),
            other => RuntimeError::KernelFailure(other.to_string()),
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
