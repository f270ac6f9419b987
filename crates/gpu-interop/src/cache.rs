//! One shared texture, reused while the frame size holds.

use std::os::fd::IntoRawFd;
use std::sync::Arc;

use ash::vk;
use glvk_procs::ffi::{GLuint, GL_HANDLE_TYPE_OPAQUE_FD_EXT, GL_OPTIMAL_TILING_EXT, GL_TEXTURE_TILING_EXT};
use glvk_procs::ProcTable;
use tracing::{debug, error, trace};

use crate::bridge::{InteropDevice, SharedImage, TextureDescriptor, TextureSize};
use crate::error::InteropError;

const TEXTURE_LABEL: &str = "GLVK shared texture";

/// A Vulkan image and the GL texture aliasing its memory.
///
/// Dropping it deletes the GL texture and memory object (the bridging
/// context must be current) and then destroys the Vulkan image.
pub struct CachedTexture<D: InteropDevice> {
    device: Arc<D>,
    gl: Arc<ProcTable>,
    image: SharedImage,
    descriptor: TextureDescriptor,
    gl_memory: GLuint,
    gl_texture: GLuint,
    layout: vk::ImageLayout,
    delete_gl_objects: bool,
}

impl<D: InteropDevice> CachedTexture<D> {
    fn create(
        device: &Arc<D>,
        gl: &Arc<ProcTable>,
        descriptor: TextureDescriptor,
    ) -> Result<Self, InteropError> {
        let Some(internal_format) = descriptor.gl_internal_format() else {
            return Err(InteropError::AllocationFailure(format!(
                "{:?} has no GL equivalent",
                descriptor.format
            )));
        };

        let (gl_width, gl_height) = descriptor.size.gl_extent()?;
        let mut image = device.create_shared_image(&descriptor)?;
        let Some(fd) = image.fd.take() else {
            device.destroy_shared_image(&image);
            return Err(InteropError::AllocationFailure(
                "image memory was not exported".into(),
            ));
        };

        let TextureSize { width, height } = descriptor.size;
        let mut gl_memory = 0;
        let mut gl_texture = 0;
        unsafe {
            gl.create_memory_objects_ext.call(|f| f(1, &mut gl_memory));
            // GL owns the descriptor from here on, even if the import fails.
            let raw_fd = fd.into_raw_fd();
            gl.import_memory_fd_ext.call(|f| {
                f(
                    gl_memory,
                    image.allocation_size,
                    GL_HANDLE_TYPE_OPAQUE_FD_EXT,
                    raw_fd,
                )
            });

            gl.gen_textures.call(|f| f(1, &mut gl_texture));
            gl.bind_texture.call(|f| f(gl::TEXTURE_2D, gl_texture));
            gl.tex_parameteri.call(|f| {
                f(
                    gl::TEXTURE_2D,
                    GL_TEXTURE_TILING_EXT,
                    GL_OPTIMAL_TILING_EXT as i32,
                )
            });
            gl.tex_storage_mem_2d_ext.call(|f| {
                f(
                    gl::TEXTURE_2D,
                    1,
                    internal_format,
                    gl_width,
                    gl_height,
                    gl_memory,
                    0,
                )
            });
            gl.bind_texture.call(|f| f(gl::TEXTURE_2D, 0));
        }

        let texture = Self {
            device: Arc::clone(device),
            gl: Arc::clone(gl),
            image,
            descriptor,
            gl_memory,
            gl_texture,
            layout: vk::ImageLayout::UNDEFINED,
            delete_gl_objects: true,
        };

        if texture.image.image == vk::Image::null()
            || texture.image.view == vk::ImageView::null()
            || texture.gl_memory == 0
            || texture.gl_texture == 0
        {
            error!(size = ?descriptor.size, "Shared texture came back incomplete");
            return Err(InteropError::AllocationFailure(
                "shared texture is missing a handle".into(),
            ));
        }

        gl.set_texture_label(texture.gl_texture, TEXTURE_LABEL);
        debug!(
            width,
            height,
            bytes = texture.image.allocation_size,
            "Allocated shared texture"
        );
        Ok(texture)
    }

    pub fn image(&self) -> vk::Image {
        self.image.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }

    pub fn gl_texture(&self) -> GLuint {
        self.gl_texture
    }

    pub fn size(&self) -> TextureSize {
        self.descriptor.size
    }

    pub fn format(&self) -> vk::Format {
        self.descriptor.format
    }

    /// Layout of the image as of the last completed transition.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }
}

impl<D: InteropDevice> Drop for CachedTexture<D> {
    fn drop(&mut self) {
        if self.delete_gl_objects {
            unsafe {
                self.gl.delete_textures.call(|f| f(1, &self.gl_texture));
                self.gl
                    .delete_memory_objects_ext
                    .call(|f| f(1, &self.gl_memory));
            }
        }
        self.device.destroy_shared_image(&self.image);
    }
}

/// Holds at most one [`CachedTexture`], reallocated only when the requested
/// size changes.
pub struct TextureCache<D: InteropDevice> {
    device: Arc<D>,
    gl: Arc<ProcTable>,
    format: vk::Format,
    cached: Option<CachedTexture<D>>,
}

impl<D: InteropDevice> TextureCache<D> {
    pub fn new(device: Arc<D>, gl: Arc<ProcTable>, format: vk::Format) -> Self {
        Self {
            device,
            gl,
            format,
            cached: None,
        }
    }

    /// The cached texture if it already has `size`, otherwise a fresh one.
    ///
    /// A texture of another size is released before the new allocation. If
    /// the allocation fails the cache is left empty.
    pub fn acquire(&mut self, size: TextureSize) -> Result<&mut CachedTexture<D>, InteropError> {
        let reusable = self
            .cached
            .as_ref()
            .is_some_and(|texture| texture.size() == size);

        if !reusable {
            if let Some(previous) = &self.cached {
                debug!(from = ?previous.size(), to = ?size, "Reallocating shared texture");
            }
            self.release();
            let descriptor = TextureDescriptor {
                size,
                format: self.format,
            };
            let texture = CachedTexture::create(&self.device, &self.gl, descriptor)?;
            return Ok(self.cached.insert(texture));
        }

        trace!(?size, "Reusing shared texture");
        match self.cached.as_mut() {
            Some(texture) => Ok(texture),
            None => Err(InteropError::AllocationFailure("texture cache is empty".into())),
        }
    }

    /// Free the cached texture. Safe to call when empty.
    pub fn release(&mut self) {
        self.cached = None;
    }

    /// Free the Vulkan side of the cached texture without touching GL, for
    /// when the bridging context can no longer be made current.
    pub fn abandon(&mut self) {
        if let Some(mut texture) = self.cached.take() {
            debug!(size = ?texture.size(), "Abandoning GL names of shared texture");
            texture.delete_gl_objects = false;
        }
    }

    pub fn size(&self) -> Option<TextureSize> {
        self.cached.as_ref().map(CachedTexture::size)
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_none()
    }

    pub fn current(&self) -> Option<&CachedTexture<D>> {
        self.cached.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DeviceEvent, FakeDevice};
    use glvk_procs::mock::MockGl;
    use glvk_procs::ProcDebugOptions;

    fn cache(mock: &MockGl) -> (Arc<FakeDevice>, TextureCache<FakeDevice>) {
        let device = Arc::new(FakeDevice::new());
        let gl = Arc::new(ProcTable::new(&mock.resolver(), ProcDebugOptions::default()));
        let cache = TextureCache::new(Arc::clone(&device), gl, vk::Format::R8G8B8A8_UNORM);
        (device, cache)
    }

    #[test]
    fn same_size_is_reused() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);

        let first = cache.acquire(TextureSize::new(256, 256)).unwrap().image();
        let second = cache.acquire(TextureSize::new(256, 256)).unwrap().image();

        assert_eq!(first, second);
        assert_eq!(device.allocations(), 1);
        assert_eq!(device.deallocations(), 0);
        assert_eq!(mock.call_count("glImportMemoryFdEXT"), 1);
    }

    #[test]
    fn resize_releases_before_allocating() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);

        let small = cache.acquire(TextureSize::new(256, 256)).unwrap().image();
        let large = cache.acquire(TextureSize::new(512, 512)).unwrap().image();

        assert_ne!(small, large);
        assert_eq!(cache.current().map(CachedTexture::image), Some(large));
        assert_eq!(
            device.events(),
            vec![
                DeviceEvent::Allocate(small, TextureSize::new(256, 256)),
                DeviceEvent::Deallocate(small),
                DeviceEvent::Allocate(large, TextureSize::new(512, 512)),
            ]
        );
        assert_eq!(cache.size(), Some(TextureSize::new(512, 512)));
        assert_eq!(mock.live_textures(), 1);
        assert_eq!(mock.live_memory_objects(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);
        cache.acquire(TextureSize::new(64, 32)).unwrap();

        cache.release();
        cache.release();

        assert!(cache.is_empty());
        assert_eq!(device.deallocations(), 1);
        assert_eq!(device.live_images(), 0);
        assert_eq!(mock.live_textures(), 0);
        assert_eq!(mock.live_memory_objects(), 0);
    }

    #[test]
    fn allocation_failure_leaves_cache_empty() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);
        cache.acquire(TextureSize::new(16, 16)).unwrap();

        device.fail_allocations(true);
        let err = cache.acquire(TextureSize::new(32, 32)).err();
        assert!(matches!(err, Some(InteropError::AllocationFailure(_))));
        assert!(cache.is_empty());
        assert_eq!(device.deallocations(), 1);

        device.fail_allocations(false);
        assert!(cache.acquire(TextureSize::new(32, 32)).is_ok());
    }

    #[test]
    fn oversized_request_allocates_nothing() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);

        let err = cache.acquire(TextureSize::new(u32::MAX, 16)).err();
        assert!(matches!(err, Some(InteropError::AllocationFailure(_))));
        assert!(cache.current().is_none());
        assert_eq!(device.allocations(), 0);
        assert_eq!(mock.call_count("glTexStorageMem2DEXT"), 0);
    }

    #[test]
    fn imported_memory_and_label() {
        let mock = MockGl::install();
        let (_device, mut cache) = cache(&mock);
        let texture = cache.acquire(TextureSize::new(8, 8)).unwrap();
        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
        assert_ne!(texture.gl_texture(), 0);
        assert_eq!(mock.imported_fds(), 1);
        assert_eq!(mock.call_count("glTexStorageMem2DEXT"), 1);
        assert_eq!(mock.call_count("glObjectLabelKHR"), 1);
    }

    #[test]
    fn unsupported_format_allocates_nothing() {
        let mock = MockGl::install();
        let device = Arc::new(FakeDevice::new());
        let gl = Arc::new(ProcTable::new(&mock.resolver(), ProcDebugOptions::default()));
        let mut cache = TextureCache::new(Arc::clone(&device), gl, vk::Format::B8G8R8A8_UNORM);

        assert!(cache.acquire(TextureSize::new(8, 8)).is_err());
        assert_eq!(device.allocations(), 0);
    }

    #[test]
    fn abandon_skips_gl_deletes() {
        let mock = MockGl::install();
        let (device, mut cache) = cache(&mock);
        cache.acquire(TextureSize::new(8, 8)).unwrap();
        mock.clear_calls();

        cache.abandon();

        assert!(cache.is_empty());
        assert_eq!(device.deallocations(), 1);
        assert_eq!(mock.call_count("glDeleteTextures"), 0);
        assert_eq!(mock.live_textures(), 1);
    }
}
