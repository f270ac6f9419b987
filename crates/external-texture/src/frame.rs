//! The per-frame driver.

use std::sync::Arc;

use ash::vk;
use glvk_procs::ffi::GLuint;
use gpu_interop::{
    BridgeState, CachedTexture, InteropConfig, InteropDevice, InteropError, SyncBridge,
    TextureCache, TextureSize, Trampoline,
};
use tracing::{debug, error, trace, warn};

use crate::context::{BridgingContext, CurrentContext};
use crate::source::ExternalImageSource;

const BLIT_DEBUG_GROUP: &str = "External texture blit";

/// Where the last frame got to.
///
/// A frame walks `Idle → ContextAcquired → TextureReady → Blitted →
/// Published`, or ends in `Failed` from any step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    ContextAcquired,
    TextureReady,
    Blitted,
    Published,
    Failed,
}

/// A converted frame, ready for the consumer to sample.
///
/// The image stays owned by the bridge and is valid until the next
/// [`ExternalTextureVk::convert`] of a different size, a
/// [`detach`](ExternalTextureVk::detach), or a
/// [`release`](ExternalTextureVk::release).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationTexture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub size: TextureSize,
    pub format: vk::Format,
    pub layout: vk::ImageLayout,
}

impl DestinationTexture {
    fn from_cached<D: InteropDevice>(texture: &CachedTexture<D>) -> Self {
        Self {
            image: texture.image(),
            view: texture.view(),
            size: texture.size(),
            format: texture.format(),
            layout: texture.layout(),
        }
    }
}

/// Converts external GL images into Vulkan textures, one frame at a time.
///
/// One instance per bridging context, used from a single thread. Assumes a
/// single consumer with at most one frame in flight: a published texture
/// must be done being sampled before the next `convert` call rewrites it.
pub struct ExternalTextureVk<C: BridgingContext, D: InteropDevice> {
    context: C,
    trampoline: Option<Trampoline>,
    cache: Option<TextureCache<D>>,
    sync: SyncBridge<D>,
    last_frame_state: FrameState,
    released: bool,
}

impl<C: BridgingContext, D: InteropDevice> ExternalTextureVk<C, D> {
    /// Resolve GL entry points and build the conversion program in
    /// `context`. Failures leave the bridge permanently invalid; check
    /// [`is_valid`](Self::is_valid).
    pub fn new(context: C, device: Arc<D>, config: InteropConfig) -> Self {
        let sync = SyncBridge::new(Arc::clone(&device), config.fence_timeout);

        let (trampoline, cache) = match CurrentContext::acquire(&context) {
            Some(_current) => {
                let trampoline = Trampoline::new(
                    &|name: &str| context.get_proc_address(name),
                    config.debug,
                );
                let cache = trampoline.is_valid().then(|| {
                    TextureCache::new(
                        Arc::clone(&device),
                        Arc::clone(trampoline.proc_table()),
                        config.format,
                    )
                });
                (Some(trampoline), cache)
            }
            None => {
                error!("Could not make the bridging context current.");
                (None, None)
            }
        };

        Self {
            context,
            trampoline,
            cache,
            sync,
            last_frame_state: FrameState::Idle,
            released: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.released && self.state() == BridgeState::Valid
    }

    pub fn state(&self) -> BridgeState {
        self.trampoline
            .as_ref()
            .map_or(BridgeState::Invalid, Trampoline::state)
    }

    /// Why construction failed, if it did.
    pub fn construction_error(&self) -> Option<InteropError> {
        match &self.trampoline {
            Some(trampoline) => trampoline.failure().cloned(),
            None => Some(InteropError::ContextAcquisitionFailure),
        }
    }

    pub fn last_frame_state(&self) -> FrameState {
        self.last_frame_state
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Copy the newest image of `source` into a `width`x`height` Vulkan
    /// texture and return it in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// A failed frame publishes nothing. Per-frame failures leave the bridge
    /// usable for the next call.
    pub fn convert<S: ExternalImageSource + ?Sized>(
        &mut self,
        source: &mut S,
        width: u32,
        height: u32,
    ) -> Result<DestinationTexture, InteropError> {
        let mut state = FrameState::Idle;
        let result = self.run_frame(source, TextureSize::new(width, height), &mut state);
        if let Err(err) = &result {
            if err.is_per_frame() {
                warn!(?state, width, height, "Dropping external texture frame: {err}");
            } else {
                debug!("Skipping external texture frame: {err}");
            }
            state = FrameState::Failed;
        }
        self.last_frame_state = state;
        result
    }

    /// [`convert`](Self::convert) at the size `source` reports.
    pub fn convert_latest<S: ExternalImageSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<DestinationTexture, InteropError> {
        let size = source.dimensions().unwrap_or(TextureSize::new(0, 0));
        self.convert(source, size.width, size.height)
    }

    fn run_frame<S: ExternalImageSource + ?Sized>(
        &mut self,
        source: &mut S,
        size: TextureSize,
        state: &mut FrameState,
    ) -> Result<DestinationTexture, InteropError> {
        if !self.is_valid() {
            return Err(InteropError::InvalidBridge);
        }
        if size.is_empty() {
            return Err(InteropError::EmptyFrame {
                width: size.width,
                height: size.height,
            });
        }
        let (Some(trampoline), Some(cache)) = (self.trampoline.as_ref(), self.cache.as_mut())
        else {
            return Err(InteropError::InvalidBridge);
        };

        let Some(_current) = CurrentContext::acquire(&self.context) else {
            // The cached texture's GL names are unreachable without the
            // context; free what can still be freed.
            if !cache.is_empty() {
                self.sync.settle();
            }
            cache.abandon();
            return Err(InteropError::ContextAcquisitionFailure);
        };
        advance(state, FrameState::ContextAcquired);

        // A parked transition may still reference the image a resize frees.
        if cache.size().is_some_and(|cached| cached != size) {
            self.sync.settle();
        }
        let texture = cache.acquire(size)?;
        advance(state, FrameState::TextureReady);

        let gl = trampoline.proc_table();
        let mut source_texture = 0;
        unsafe { gl.gen_textures.call(|f| f(1, &mut source_texture)) };
        source.attach(source_texture);
        source.update();
        let blitted = transition_and_copy(trampoline, &mut self.sync, texture, source_texture, size);
        source.detach();
        unsafe { gl.delete_textures.call(|f| f(1, &source_texture)) };
        blitted?;
        advance(state, FrameState::Blitted);

        let published = DestinationTexture::from_cached(texture);
        advance(state, FrameState::Published);
        Ok(published)
    }

    /// Free the cached texture. The bridge stays valid and allocates again
    /// on the next frame.
    pub fn detach(&mut self) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        if cache.is_empty() {
            return;
        }
        self.sync.settle();
        match CurrentContext::acquire(&self.context) {
            Some(_current) => cache.release(),
            None => {
                warn!("Could not make the bridging context current to detach, leaking GL names.");
                cache.abandon();
            }
        }
    }

    /// Free the cached texture and the conversion program. Later calls, and
    /// the drop that follows, do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sync.drain();

        let current = CurrentContext::acquire(&self.context);
        if current.is_none() {
            warn!("Could not make the bridging context current to release, leaking GL names.");
        }
        if let Some(mut cache) = self.cache.take() {
            if current.is_some() {
                cache.release();
            } else {
                cache.abandon();
            }
        }
        if let Some(trampoline) = self.trampoline.take() {
            if current.is_some() {
                drop(trampoline);
            } else {
                trampoline.abandon();
            }
        }
        drop(current);
        debug!("Released external texture bridge");
    }
}

impl<C: BridgingContext, D: InteropDevice> Drop for ExternalTextureVk<C, D> {
    fn drop(&mut self) {
        self.release();
    }
}

fn advance(state: &mut FrameState, next: FrameState) {
    trace!(from = ?*state, to = ?next, "Frame state");
    *state = next;
}

/// Pre-transition, blit, post-transition.
fn transition_and_copy<D: InteropDevice>(
    trampoline: &Trampoline,
    sync: &mut SyncBridge<D>,
    texture: &mut CachedTexture<D>,
    source_texture: GLuint,
    size: TextureSize,
) -> Result<(), InteropError> {
    sync.transition_layout(texture, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;

    let gl = trampoline.proc_table();
    gl.push_debug_group(BLIT_DEBUG_GROUP);
    let copied = trampoline.copy_texture(source_texture, texture.gl_texture(), size);
    gl.pop_debug_group();
    copied?;

    sync.transition_layout(texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
}
