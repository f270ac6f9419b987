//! Dynamically resolved OpenGL entry points for the GL side of the GL-Vulkan
//! texture bridge.
//!
//! The bridge runs on an offscreen context owned by the platform layer, so GL
//! symbols are resolved through a caller-supplied resolver (typically
//! `eglGetProcAddress`) instead of a process-wide loader. Each resolved symbol
//! is wrapped in a [`GlProc`] that can log calls, trap GL errors and assert
//! single-thread use in debug builds.
//!
//! Enable the `mock` feature to get [`mock::MockGl`], a recording fake driver
//! that plugs into the same resolver interface.

pub mod errors;
pub mod ffi;
pub mod proc;
pub mod table;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use errors::{gl_error_is_fatal, gl_error_to_str};
pub use proc::{GlProc, GlProcBase, ProcDebugOptions};
pub use table::ProcTable;
