//! Per-frame conversion of a GL external image into a Vulkan texture.
//!
//! [`ExternalTextureVk`] ties together a [`BridgingContext`] (a GL context
//! sharing the producer's images), an [`ExternalImageSource`] (the
//! producer) and an [`InteropDevice`](gpu_interop::InteropDevice). Each
//! [`ExternalTextureVk::convert`] call yields a [`DestinationTexture`] in
//! `SHADER_READ_ONLY_OPTIMAL`, ready for the consumer to sample.

pub mod context;
pub mod frame;
pub mod source;

pub use context::{BridgingContext, CurrentContext};
pub use frame::{DestinationTexture, ExternalTextureVk, FrameState};
pub use source::ExternalImageSource;

pub use gpu_interop::{InteropConfig, InteropError, TextureSize};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Hosts that already installed a subscriber keep theirs; calling this more
/// than once is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
