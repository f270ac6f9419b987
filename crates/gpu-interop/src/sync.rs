//! Layout transitions of the shared image, with a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, trace, warn};

use crate::bridge::{FenceWait, InteropDevice};
use crate::cache::CachedTexture;
use crate::error::InteropError;

/// Stage and access masks of one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub new_layout: vk::ImageLayout,
    pub src_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub dst_access_mask: vk::AccessFlags,
}

impl TransitionBarrier {
    /// Barrier into `new_layout`.
    ///
    /// The previous user of the image is either the consumer's fragment
    /// shader or an earlier blit, so both are waited on. The destination
    /// masks cover what happens next in the new layout.
    pub fn to_layout(new_layout: vk::ImageLayout) -> Self {
        let (dst_stage_mask, dst_access_mask) = match new_layout {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            _ => (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ),
        };
        Self {
            new_layout,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_stage_mask,
            dst_access_mask,
        }
    }
}

/// A submission whose fence did not signal in time. Its command buffer and
/// fence stay alive until the GPU is done with them.
#[derive(Debug)]
struct Parked {
    commands: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Records, submits and waits for layout transitions on the shared image.
///
/// Every transition blocks until its fence signals, so the tracked layout on
/// the [`CachedTexture`] is always the layout the GPU has actually reached.
pub struct SyncBridge<D: InteropDevice> {
    device: Arc<D>,
    timeout: Duration,
    parked: Vec<Parked>,
}

impl<D: InteropDevice> SyncBridge<D> {
    pub fn new(device: Arc<D>, timeout: Duration) -> Self {
        Self {
            device,
            timeout,
            parked: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transition `texture` to `new_layout` and wait for it to complete.
    ///
    /// On timeout the frame fails, the submission is parked for later
    /// reclamation and the tracked layout becomes `UNDEFINED`, as the image
    /// is in an unknown state.
    pub fn transition_layout(
        &mut self,
        texture: &mut CachedTexture<D>,
        new_layout: vk::ImageLayout,
    ) -> Result<(), InteropError> {
        self.reclaim_signaled();

        let old_layout = texture.layout();
        if old_layout == new_layout {
            trace!(?new_layout, "Image already in requested layout");
            return Ok(());
        }

        let barrier = TransitionBarrier::to_layout(new_layout);
        let commands = self.device.begin_commands()?;
        self.device
            .cmd_image_barrier(commands, texture.image(), old_layout, &barrier);
        if let Err(err) = self.device.end_commands(commands) {
            self.device.free_commands(commands);
            return Err(err);
        }

        let fence = match self.device.create_fence() {
            Ok(fence) => fence,
            Err(err) => {
                self.device.free_commands(commands);
                return Err(err);
            }
        };

        if let Err(err) = self.device.submit(commands, fence) {
            warn!(?old_layout, ?new_layout, "Could not submit layout transition: {err}");
            self.device.destroy_fence(fence);
            self.device.free_commands(commands);
            return Err(err);
        }

        match self.device.wait_for_fence(fence, self.timeout) {
            Ok(FenceWait::Signaled) => {
                self.device.destroy_fence(fence);
                self.device.free_commands(commands);
                texture.set_layout(new_layout);
                trace!(?old_layout, ?new_layout, "Layout transition complete");
                Ok(())
            }
            Ok(FenceWait::TimedOut) => {
                warn!(
                    ?old_layout,
                    ?new_layout,
                    timeout = ?self.timeout,
                    "Layout transition timed out"
                );
                self.park(commands, fence, texture);
                Err(InteropError::FenceTimeout(self.timeout))
            }
            Err(err) => {
                warn!(?old_layout, ?new_layout, "Waiting for layout transition failed: {err}");
                self.park(commands, fence, texture);
                Err(err)
            }
        }
    }

    fn park(
        &mut self,
        commands: vk::CommandBuffer,
        fence: vk::Fence,
        texture: &mut CachedTexture<D>,
    ) {
        self.parked.push(Parked { commands, fence });
        texture.set_layout(vk::ImageLayout::UNDEFINED);
    }

    /// Submissions still waiting for their fence.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Free parked submissions whose fences have signaled since.
    pub fn reclaim_signaled(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let device = &self.device;
        self.parked.retain(|parked| match device.is_fence_signaled(parked.fence) {
            Ok(true) => {
                device.destroy_fence(parked.fence);
                device.free_commands(parked.commands);
                false
            }
            Ok(false) => true,
            Err(err) => {
                trace!("Fence query failed, keeping submission parked: {err}");
                true
            }
        });
        trace!(remaining = self.parked.len(), "Reclaimed parked submissions");
    }

    /// Make sure no parked submission still references an image that is
    /// about to be destroyed: reclaim what has finished and drain the rest.
    pub fn settle(&mut self) {
        self.reclaim_signaled();
        self.drain();
    }

    /// Wait for the queue to drain and free every parked submission.
    pub fn drain(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        debug!(parked = self.parked.len(), "Draining parked layout transitions");
        if let Err(err) = self.device.wait_idle() {
            // Freeing in-flight work is worse than leaking it.
            warn!("Queue did not drain, leaking {} submissions: {err}", self.parked.len());
            self.parked.clear();
            return;
        }
        for parked in self.parked.drain(..) {
            self.device.destroy_fence(parked.fence);
            self.device.free_commands(parked.commands);
        }
    }
}

impl<D: InteropDevice> Drop for SyncBridge<D> {
    fn drop(&mut self) {
        self.drain();
    }
}
