//! GL ABI types and the extension constants the bridge needs.
//!
//! Core types and enums come from the `gl` crate. Tokens from
//! `GL_EXT_memory_object`, `GL_EXT_memory_object_fd`,
//! `GL_OES_EGL_image_external` and `GL_KHR_debug` are not part of the `gl`
//! crate's generated API and are spelled out here.

use std::ffi::c_void;

pub use gl::types::{
    GLbitfield, GLboolean, GLchar, GLenum, GLfloat, GLint, GLsizei, GLuint, GLuint64,
};

// =====================================================================
// GL_OES_EGL_image_external
// =====================================================================
pub const GL_TEXTURE_EXTERNAL_OES: GLenum = 0x8D65;

// =====================================================================
// GL_EXT_memory_object / GL_EXT_memory_object_fd
// =====================================================================
pub const GL_TEXTURE_TILING_EXT: GLenum = 0x9580;
pub const GL_OPTIMAL_TILING_EXT: GLenum = 0x9584;
pub const GL_HANDLE_TYPE_OPAQUE_FD_EXT: GLenum = 0x9586;

// =====================================================================
// GL_KHR_debug (ES spelling)
// =====================================================================
pub const GL_DEBUG_SOURCE_APPLICATION_KHR: GLenum = 0x824A;
pub const GL_TEXTURE_KHR: GLenum = gl::TEXTURE;

// =====================================================================
// Errors not covered by every GL profile
// =====================================================================
pub const GL_CONTEXT_LOST: GLenum = 0x0507;

/// Signature of `glGetError`, stored separately so every entry point can run
/// its post-call error query without borrowing the table.
pub type PfnGlGetError = unsafe extern "system" fn() -> GLenum;

/// Signature of the platform symbol resolver, e.g. `eglGetProcAddress`.
pub type ResolverFn<'a> = dyn Fn(&str) -> *const c_void + 'a;
