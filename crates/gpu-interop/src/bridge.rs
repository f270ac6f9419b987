//! Destination-API capability interface used by the bridge.

use std::os::fd::OwnedFd;
use std::time::Duration;

use ash::vk;
use glvk_procs::ffi::{GLenum, GLsizei};

use crate::error::InteropError;
use crate::sync::TransitionBarrier;

/// Texture extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

impl TextureSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width and height as GL sizes. Fails when either does not fit.
    pub fn gl_extent(&self) -> Result<(GLsizei, GLsizei), InteropError> {
        match (GLsizei::try_from(self.width), GLsizei::try_from(self.height)) {
            (Ok(width), Ok(height)) => Ok((width, height)),
            _ => Err(InteropError::AllocationFailure(format!(
                "{}x{} exceeds the GL size range",
                self.width, self.height
            ))),
        }
    }
}

/// What to allocate for a shared texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub size: TextureSize,
    pub format: vk::Format,
}

impl TextureDescriptor {
    /// Sized GL internal format with the same memory layout as `format`, if
    /// the pairing is supported.
    pub fn gl_internal_format(&self) -> Option<GLenum> {
        gl_internal_format(self.format)
    }
}

/// Vulkan formats the bridge can share with GL, and their GL counterparts.
pub fn gl_internal_format(format: vk::Format) -> Option<GLenum> {
    match format {
        vk::Format::R8G8B8A8_UNORM => Some(gl::RGBA8),
        vk::Format::R8G8B8A8_SRGB => Some(gl::SRGB8_ALPHA8),
        vk::Format::R16G16B16A16_SFLOAT => Some(gl::RGBA16F),
        vk::Format::A2B10G10R10_UNORM_PACK32 => Some(gl::RGB10_A2),
        _ => None,
    }
}

/// A 2D image with dedicated, exportable memory.
#[derive(Debug)]
pub struct SharedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    /// Byte size of `memory`, as GL needs it for the import.
    pub allocation_size: u64,
    /// Exported handle to `memory`. Taken by whoever imports it.
    pub fd: Option<OwnedFd>,
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// The subset of a Vulkan device the bridge drives.
///
/// All methods are called from the render thread. Handles passed back in are
/// always ones the same device handed out.
pub trait InteropDevice {
    /// Allocate an optimal-tiling image usable as a color attachment and as a
    /// sampled texture, backed by memory exported as an opaque fd.
    fn create_shared_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<SharedImage, InteropError>;

    /// Destroy the view and image and free their memory.
    fn destroy_shared_image(&self, image: &SharedImage);

    /// Allocate a primary command buffer and begin one-time recording.
    fn begin_commands(&self) -> Result<vk::CommandBuffer, InteropError>;

    /// Record a whole-image layout transition.
    fn cmd_image_barrier(
        &self,
        commands: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        barrier: &TransitionBarrier,
    );

    fn end_commands(&self, commands: vk::CommandBuffer) -> Result<(), InteropError>;

    fn create_fence(&self) -> Result<vk::Fence, InteropError>;

    /// Submit `commands` alone, signaling `fence` on completion.
    fn submit(&self, commands: vk::CommandBuffer, fence: vk::Fence) -> Result<(), InteropError>;

    /// Block until `fence` signals or `timeout` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration)
        -> Result<FenceWait, InteropError>;

    /// Non-blocking fence query.
    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool, InteropError>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn free_commands(&self, commands: vk::CommandBuffer);

    /// Block until the submission queue is idle.
    fn wait_idle(&self) -> Result<(), InteropError>;
}
