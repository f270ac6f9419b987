//! Fixed classification of GL error codes.

use crate::ffi::{GLenum, GL_CONTEXT_LOST};

/// Human readable name for a `glGetError` result.
pub fn gl_error_to_str(value: GLenum) -> &'static str {
    match value {
        gl::NO_ERROR => "GL_NO_ERROR",
        gl::INVALID_ENUM => "GL_INVALID_ENUM",
        gl::INVALID_VALUE => "GL_INVALID_VALUE",
        gl::INVALID_OPERATION => "GL_INVALID_OPERATION",
        gl::INVALID_FRAMEBUFFER_OPERATION => "GL_INVALID_FRAMEBUFFER_OPERATION",
        gl::OUT_OF_MEMORY => "GL_OUT_OF_MEMORY",
        gl::STACK_OVERFLOW => "GL_STACK_OVERFLOW",
        gl::STACK_UNDERFLOW => "GL_STACK_UNDERFLOW",
        GL_CONTEXT_LOST => "GL_CONTEXT_LOST",
        _ => "Unknown",
    }
}

/// Whether a GL error indicates a programming error in the bridge (fatal) or
/// a condition that is only logged.
///
/// Context loss and debug-group stack errors are recoverable: the frame is
/// dropped by the caller and the next frame starts fresh.
pub fn gl_error_is_fatal(value: GLenum) -> bool {
    matches!(
        value,
        gl::INVALID_ENUM
            | gl::INVALID_VALUE
            | gl::INVALID_OPERATION
            | gl::INVALID_FRAMEBUFFER_OPERATION
            | gl::OUT_OF_MEMORY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_usage_is_fatal() {
        assert!(gl_error_is_fatal(gl::INVALID_OPERATION));
        assert!(gl_error_is_fatal(gl::OUT_OF_MEMORY));
        assert!(!gl_error_is_fatal(gl::NO_ERROR));
    }

    #[test]
    fn context_loss_is_recoverable() {
        assert!(!gl_error_is_fatal(GL_CONTEXT_LOST));
        assert!(!gl_error_is_fatal(gl::STACK_OVERFLOW));
        assert_eq!(gl_error_to_str(GL_CONTEXT_LOST), "GL_CONTEXT_LOST");
    }

    #[test]
    fn unknown_codes_are_named_and_logged_only() {
        assert_eq!(gl_error_to_str(0xDEAD), "Unknown");
        assert!(!gl_error_is_fatal(0xDEAD));
    }
}
