//! Failure kinds of the bridge.

use std::fmt;
use std::time::Duration;

use glvk_procs::ffi::GLenum;

/// Shader stage (or the link step) that failed to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Program,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShaderStage::Vertex => "vertex shader",
            ShaderStage::Fragment => "fragment shader",
            ShaderStage::Program => "program",
        })
    }
}

/// Every way the bridge can fail.
///
/// Construction failures ([`ResolutionFailure`](Self::ResolutionFailure),
/// [`CompileLinkFailure`](Self::CompileLinkFailure)) are permanent; the rest
/// drop a single frame and the next frame starts fresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InteropError {
    #[error("required GL entry points did not resolve: {}", missing.join(", "))]
    ResolutionFailure { missing: Vec<&'static str> },

    #[error("{stage} failed to build: {log}")]
    CompileLinkFailure { stage: ShaderStage, log: String },

    #[error("could not allocate shared texture: {0}")]
    AllocationFailure(String),

    #[error("could not submit layout transition: {0}")]
    SubmissionFailure(String),

    #[error("layout transition did not complete within {0:?}")]
    FenceTimeout(Duration),

    #[error("could not make the bridging context current")]
    ContextAcquisitionFailure,

    #[error("blit framebuffer is incomplete (status {0:#06x})")]
    IncompleteFramebuffer(GLenum),

    #[error("bridge is not valid")]
    InvalidBridge,

    #[error("refusing to convert an empty {width}x{height} frame")]
    EmptyFrame { width: u32, height: u32 },
}

impl InteropError {
    /// True if the failure only affects the current frame.
    pub fn is_per_frame(&self) -> bool {
        !matches!(
            self,
            InteropError::ResolutionFailure { .. }
                | InteropError::CompileLinkFailure { .. }
                | InteropError::InvalidBridge
        )
    }
}
