//! WGSL kernel generation for Tessera.
//!
//! Device instructions in Tessera are elementwise operators. This crate turns
//! an operator into a WGSL compute kernel and compiles it with naga_oil, so
//! that `tessera-runtime` backends only ever deal with validated modules.
//!
//! # Example
//!
//! ```no_run
//! use tessera_codegen::KernelSpec;
//! use tessera_core::UnaryOp;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = KernelSpec::specialized(UnaryOp::Exp, 12).compile()?;
//! println!("compiled {}", kernel.label);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod kernel;
pub mod templates;

pub use error::{CodegenError, Result};
pub use kernel::{BUILTIN_WORKGROUP_SIZE, GeneratedKernel, KernelSpec};
pub use templates::{ENTRY_POINT, render_elementwise};
