//! GL-to-Vulkan texture bridging.
//!
//! An image produced on the GL side (typically an Android `SurfaceTexture`
//! sampled as `GL_TEXTURE_EXTERNAL_OES`) is blitted into a texture whose
//! memory is owned by Vulkan and imported into GL through
//! `GL_EXT_memory_object_fd`. No pixels cross the CPU.
//!
//! - [`InteropDevice`] is the capability interface for the Vulkan side;
//!   [`vulkan::VulkanDevice`] implements it on top of `ash`.
//! - [`Trampoline`] owns the resolved GL entry points and the
//!   [`ConversionProgram`] and performs the blit.
//! - [`TextureCache`] keeps one shared texture sized to the current frame.
//! - [`SyncBridge`] moves the shared texture between layouts with a blocking,
//!   bounded fence wait.
//!
//! Memory is exchanged as opaque POSIX file descriptors, so the crate is
//! unix-only.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod program;
pub mod sync;
pub mod trampoline;
pub mod vulkan;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bridge::{FenceWait, InteropDevice, SharedImage, TextureDescriptor, TextureSize};
pub use cache::{CachedTexture, TextureCache};
pub use config::InteropConfig;
pub use error::{InteropError, ShaderStage};
pub use program::{ConversionProgram, ProgramInputs};
pub use sync::{SyncBridge, TransitionBarrier};
pub use trampoline::{BridgeState, Trampoline};
