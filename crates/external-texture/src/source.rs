//! The producer of external images.

use glvk_procs::ffi::GLuint;
use gpu_interop::TextureSize;

/// A stream of images sampled as `GL_TEXTURE_EXTERNAL_OES`, such as an
/// Android `SurfaceTexture`.
///
/// Called only from the render thread with the bridging context current.
pub trait ExternalImageSource {
    /// Attach the stream to the GL texture name `texture`.
    fn attach(&mut self, texture: GLuint);

    /// Latch the newest available image into the attached texture.
    fn update(&mut self);

    /// Detach from the texture passed to [`attach`](Self::attach).
    fn detach(&mut self);

    /// Size of the newest image, if known.
    fn dimensions(&self) -> Option<TextureSize> {
        None
    }
}
