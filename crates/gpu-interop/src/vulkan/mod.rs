//! [`InteropDevice`](crate::InteropDevice) on a real Vulkan device.

mod device;

pub use device::VulkanDevice;
