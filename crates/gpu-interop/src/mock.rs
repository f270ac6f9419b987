//! A counting stand-in for the Vulkan device.
//!
//! Hands out unique fake handles, keeps an ordered event log of
//! allocations, deallocations and transitions, and can be told to fail
//! allocations or to let fences hang.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;

use crate::bridge::{FenceWait, InteropDevice, SharedImage, TextureDescriptor, TextureSize};
use crate::error::InteropError;
use crate::sync::TransitionBarrier;

/// What happens to the next submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceBehavior {
    /// Fences signal immediately.
    Signal,
    /// Fences never signal on their own; waits run out the full timeout.
    Hang,
    /// `submit` itself fails.
    SubmitError,
    /// `submit` succeeds but waiting on the fence reports an error.
    WaitError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Allocate(vk::Image, TextureSize),
    Deallocate(vk::Image),
    Transition {
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Submit(vk::CommandBuffer),
    WaitIdle,
}

#[derive(Debug)]
pub struct FakeDevice {
    next_handle: Cell<u64>,
    events: RefCell<Vec<DeviceEvent>>,
    fail_allocations: Cell<bool>,
    fence_behavior: Cell<FenceBehavior>,
    images: RefCell<HashSet<vk::Image>>,
    commands: RefCell<HashSet<vk::CommandBuffer>>,
    fences: RefCell<HashMap<vk::Fence, bool>>,
    wait_idle_calls: Cell<usize>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            next_handle: Cell::new(0x1000),
            events: RefCell::new(Vec::new()),
            fail_allocations: Cell::new(false),
            fence_behavior: Cell::new(FenceBehavior::Signal),
            images: RefCell::new(HashSet::new()),
            commands: RefCell::new(HashSet::new()),
            fences: RefCell::new(HashMap::new()),
            wait_idle_calls: Cell::new(0),
        }
    }

    fn handle<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    pub fn set_fence_behavior(&self, behavior: FenceBehavior) {
        self.fence_behavior.set(behavior);
    }

    /// Let every fence left hanging by [`FenceBehavior::Hang`] signal.
    pub fn signal_hung_fences(&self) {
        for signaled in self.fences.borrow_mut().values_mut() {
            *signaled = true;
        }
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.borrow().clone()
    }

    pub fn allocations(&self) -> usize {
        self.count(|event| matches!(event, DeviceEvent::Allocate(..)))
    }

    pub fn deallocations(&self) -> usize {
        self.count(|event| matches!(event, DeviceEvent::Deallocate(_)))
    }

    pub fn submissions(&self) -> usize {
        self.count(|event| matches!(event, DeviceEvent::Submit(_)))
    }

    fn count(&self, filter: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|event| filter(event)).count()
    }

    pub fn live_images(&self) -> usize {
        self.images.borrow().len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.borrow().len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.commands.borrow().len()
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.wait_idle_calls.get()
    }

    fn log(&self, event: DeviceEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl InteropDevice for FakeDevice {
    fn create_shared_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<SharedImage, InteropError> {
        if self.fail_allocations.get() {
            return Err(InteropError::AllocationFailure("out of device memory".into()));
        }
        let fd: OwnedFd = File::open("/dev/null")
            .map_err(|err| InteropError::AllocationFailure(err.to_string()))?
            .into();
        let image: vk::Image = self.handle();
        self.images.borrow_mut().insert(image);
        self.log(DeviceEvent::Allocate(image, descriptor.size));
        Ok(SharedImage {
            image,
            view: self.handle(),
            memory: self.handle(),
            allocation_size: u64::from(descriptor.size.width) * u64::from(descriptor.size.height) * 4,
            fd: Some(fd),
        })
    }

    fn destroy_shared_image(&self, image: &SharedImage) {
        self.images.borrow_mut().remove(&image.image);
        self.log(DeviceEvent::Deallocate(image.image));
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer, InteropError> {
        let commands: vk::CommandBuffer = self.handle();
        self.commands.borrow_mut().insert(commands);
        Ok(commands)
    }

    fn cmd_image_barrier(
        &self,
        _commands: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        barrier: &TransitionBarrier,
    ) {
        self.log(DeviceEvent::Transition {
            image,
            old: old_layout,
            new: barrier.new_layout,
        });
    }

    fn end_commands(&self, _commands: vk::CommandBuffer) -> Result<(), InteropError> {
        Ok(())
    }

    fn create_fence(&self) -> Result<vk::Fence, InteropError> {
        let fence: vk::Fence = self.handle();
        self.fences.borrow_mut().insert(fence, false);
        Ok(fence)
    }

    fn submit(&self, commands: vk::CommandBuffer, fence: vk::Fence) -> Result<(), InteropError> {
        match self.fence_behavior.get() {
            FenceBehavior::SubmitError => {
                Err(InteropError::SubmissionFailure("ERROR_DEVICE_LOST".into()))
            }
            behavior => {
                self.log(DeviceEvent::Submit(commands));
                if behavior == FenceBehavior::Signal {
                    self.fences.borrow_mut().insert(fence, true);
                }
                Ok(())
            }
        }
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: Duration,
    ) -> Result<FenceWait, InteropError> {
        if self.is_fence_signaled(fence)? {
            return Ok(FenceWait::Signaled);
        }
        if self.fence_behavior.get() == FenceBehavior::WaitError {
            return Err(InteropError::SubmissionFailure("ERROR_DEVICE_LOST".into()));
        }
        std::thread::sleep(timeout);
        Ok(FenceWait::TimedOut)
    }

    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool, InteropError> {
        Ok(self.fences.borrow().get(&fence).copied().unwrap_or(false))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.borrow_mut().remove(&fence);
    }

    fn free_commands(&self, commands: vk::CommandBuffer) {
        self.commands.borrow_mut().remove(&commands);
    }

    fn wait_idle(&self) -> Result<(), InteropError> {
        self.wait_idle_calls.set(self.wait_idle_calls.get() + 1);
        self.log(DeviceEvent::WaitIdle);
        self.signal_hung_fences();
        Ok(())
    }
}
