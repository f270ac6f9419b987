use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use tracing::{debug, error};

use crate::bridge::{FenceWait, InteropDevice, SharedImage, TextureDescriptor};
use crate::error::InteropError;
use crate::sync::TransitionBarrier;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Borrowed view of the renderer's Vulkan device.
///
/// The device itself stays owned by the renderer; only the command pool is
/// created (and destroyed) here. The device must have been created with
/// `VK_KHR_external_memory_fd` enabled.
pub struct VulkanDevice {
    device: ash::Device,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue: Mutex<vk::Queue>,
    command_pool: vk::CommandPool,
}

impl VulkanDevice {
    /// # Safety
    ///
    /// `device` must be a live device created from `physical_device`, and
    /// `queue` a queue of `queue_family_index` on it. All must outlive the
    /// returned value.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> Result<Self> {
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(instance, &device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = device
            .create_command_pool(&pool_info, None)
            .context("Failed to create transition command pool")?;

        debug!(queue_family_index, "Created interop device");

        Ok(Self {
            device,
            external_memory_fd,
            memory_properties,
            queue: Mutex::new(queue),
            command_pool,
        })
    }

    fn find_memory_type_index(
        &self,
        type_bits_req: u32,
        flags_req: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            let is_required_type = type_bits_req & (1 << i) != 0;
            let has_required_flags = self
                .memory_properties
                .memory_types
                .get(i as usize)
                .is_some_and(|mt| mt.property_flags.contains(flags_req));
            is_required_type && has_required_flags
        })
    }

    /// Tear down whatever part of a shared image exists. Null handles are
    /// skipped.
    unsafe fn destroy_parts(
        &self,
        image: vk::Image,
        view: vk::ImageView,
        memory: vk::DeviceMemory,
    ) {
        if view != vk::ImageView::null() {
            self.device.destroy_image_view(view, None);
        }
        if image != vk::Image::null() {
            self.device.destroy_image(image, None);
        }
        if memory != vk::DeviceMemory::null() {
            self.device.free_memory(memory, None);
        }
    }

    unsafe fn create_shared_image_inner(
        &self,
        descriptor: &TextureDescriptor,
        image: &mut vk::Image,
        view: &mut vk::ImageView,
        memory: &mut vk::DeviceMemory,
    ) -> Result<SharedImage, InteropError> {
        let alloc_err = |what: &str, e: vk::Result| {
            InteropError::AllocationFailure(format!("{what}: {e:?}"))
        };

        let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(descriptor.format)
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_memory_info);
        *image = self
            .device
            .create_image(&image_create_info, None)
            .map_err(|e| alloc_err("create_image", e))?;

        let requirements = self.device.get_image_memory_requirements(*image);
        let memory_type_index = self
            .find_memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .ok_or_else(|| {
                InteropError::AllocationFailure("no device-local memory type".into())
            })?;

        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(*image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut export_info)
            .push_next(&mut dedicated_info);
        *memory = self
            .device
            .allocate_memory(&alloc_info, None)
            .map_err(|e| alloc_err("allocate_memory", e))?;
        self.device
            .bind_image_memory(*image, *memory, 0)
            .map_err(|e| alloc_err("bind_image_memory", e))?;

        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(*image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(descriptor.format)
            .subresource_range(COLOR_RANGE);
        *view = self
            .device
            .create_image_view(&view_create_info, None)
            .map_err(|e| alloc_err("create_image_view", e))?;

        let fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(*memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let raw_fd = self
            .external_memory_fd
            .get_memory_fd(&fd_info)
            .map_err(|e| alloc_err("get_memory_fd", e))?;

        Ok(SharedImage {
            image: *image,
            view: *view,
            memory: *memory,
            allocation_size: requirements.size,
            // SAFETY: vkGetMemoryFdKHR returns a new descriptor owned by the caller.
            fd: Some(OwnedFd::from_raw_fd(raw_fd)),
        })
    }
}

impl InteropDevice for VulkanDevice {
    fn create_shared_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<SharedImage, InteropError> {
        let mut image = vk::Image::null();
        let mut view = vk::ImageView::null();
        let mut memory = vk::DeviceMemory::null();
        unsafe {
            let result =
                self.create_shared_image_inner(descriptor, &mut image, &mut view, &mut memory);
            if let Err(err) = &result {
                error!(size = ?descriptor.size, "Could not create shared image: {err}");
                self.destroy_parts(image, view, memory);
            }
            result
        }
    }

    fn destroy_shared_image(&self, image: &SharedImage) {
        unsafe { self.destroy_parts(image.image, image.view, image.memory) };
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer, InteropError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe {
            let commands = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| {
                    InteropError::SubmissionFailure(format!("allocate_command_buffers: {e:?}"))
                })?
                .into_iter()
                .next()
                .ok_or_else(|| InteropError::SubmissionFailure("no command buffer".into()))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if let Err(e) = self.device.begin_command_buffer(commands, &begin_info) {
                self.device
                    .free_command_buffers(self.command_pool, &[commands]);
                return Err(InteropError::SubmissionFailure(format!(
                    "begin_command_buffer: {e:?}"
                )));
            }
            Ok(commands)
        }
    }

    fn cmd_image_barrier(
        &self,
        commands: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        barrier: &TransitionBarrier,
    ) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(barrier.new_layout)
            .src_access_mask(barrier.src_access_mask)
            .dst_access_mask(barrier.dst_access_mask)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                commands,
                barrier.src_stage_mask,
                barrier.dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn end_commands(&self, commands: vk::CommandBuffer) -> Result<(), InteropError> {
        unsafe { self.device.end_command_buffer(commands) }
            .map_err(|e| InteropError::SubmissionFailure(format!("end_command_buffer: {e:?}")))
    }

    fn create_fence(&self) -> Result<vk::Fence, InteropError> {
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| InteropError::SubmissionFailure(format!("create_fence: {e:?}")))
    }

    fn submit(&self, commands: vk::CommandBuffer, fence: vk::Fence) -> Result<(), InteropError> {
        let command_buffers = [commands];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let queue = self
            .queue
            .lock()
            .map_err(|_| InteropError::SubmissionFailure("queue lock poisoned".into()))?;
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
            .map_err(|e| InteropError::SubmissionFailure(format!("queue_submit: {e:?}")))
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: Duration,
    ) -> Result<FenceWait, InteropError> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(InteropError::SubmissionFailure(format!(
                "wait_for_fences: {e:?}"
            ))),
        }
    }

    fn is_fence_signaled(&self, fence: vk::Fence) -> Result<bool, InteropError> {
        unsafe { self.device.get_fence_status(fence) }
            .map_err(|e| InteropError::SubmissionFailure(format!("get_fence_status: {e:?}")))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn free_commands(&self, commands: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[commands])
        };
    }

    fn wait_idle(&self) -> Result<(), InteropError> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| InteropError::SubmissionFailure("queue lock poisoned".into()))?;
        unsafe { self.device.queue_wait_idle(*queue) }
            .map_err(|e| InteropError::SubmissionFailure(format!("queue_wait_idle: {e:?}")))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_command_pool(self.command_pool, None)
        };
    }
}
