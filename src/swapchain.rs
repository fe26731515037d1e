//! Window presentation.
//!
//! [`Swapchain`] is the [`PresentTarget`] for on-screen playback. It always uses FIFO
//! presentation, so the frame loop is paced by the display's refresh rate.
//!
//! The surface is created by the host application from its window (with
//! [`VulkanBackend::entry`] and [`VulkanBackend::instance`]) and handed over; the swapchain
//! destroys it on drop. The framebuffer size is read through a caller-supplied callback
//! whenever the surface does not report a fixed extent.
//!
//! Every swapchain image owns a binary present semaphore. Acquisition signals a spare binary
//! semaphore which is then swapped with the one stored for the acquired image, so each image
//! always carries the semaphore of its most recent acquisition.

use std::sync::Arc;

use ash::vk;
use glam::UVec2;
use serde::Deserialize;

use crate::{
    Device, Error, HasDevice, Result,
    present::{AcquiredImage, PresentTarget},
    sync::{SharedSemaphore, SyncPoint},
    vulkan::VulkanBackend,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    /// Requested image count, clamped to the surface's limits.
    pub min_image_count: u32,
    /// Prefer an sRGB surface format over a UNORM one.
    pub srgb: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            min_image_count: 3,
            srgb: false,
        }
    }
}

struct SwapchainImage {
    image: vk::Image,
    view: vk::ImageView,
    acquire_semaphore: SharedSemaphore,
    present_semaphore: SharedSemaphore,
}

pub struct Swapchain {
    vulkan: Arc<VulkanBackend>,
    device: Device,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    extent: UVec2,
    images: Vec<SwapchainImage>,
    spare_acquire_semaphore: SharedSemaphore,
    framebuffer_size: Box<dyn FnMut() -> UVec2 + Send>,
    config: SwapchainConfig,
    /// Cleared when the surface reports out-of-date, or when the window has no area.
    valid: bool,
}

impl HasDevice for Swapchain {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Swapchain {
    /// Takes ownership of `surface` and creates the first swapchain for it.
    pub fn new(
        vulkan: Arc<VulkanBackend>,
        device: Device,
        surface: vk::SurfaceKHR,
        config: SwapchainConfig,
        framebuffer_size: impl FnMut() -> UVec2 + Send + 'static,
    ) -> Result<Self> {
        let surface_loader = vulkan
            .surface_loader()
            .ok_or(Error::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let graphics = device.families().graphics;
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                vulkan.physical_device(),
                graphics,
                surface,
            )?
        };
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(Error::MissingQueueFamily(vk::QueueFlags::GRAPHICS));
        }
        let spare_acquire_semaphore = SharedSemaphore::new_binary(device.clone())?;
        let mut this = Self {
            vulkan,
            device,
            surface,
            handle: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: UVec2::ZERO,
            images: Vec::new(),
            spare_acquire_semaphore,
            framebuffer_size: Box::new(framebuffer_size),
            config,
            valid: false,
        };
        this.rebuild()?;
        Ok(this)
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn choose_surface_format(&self) -> Result<vk::SurfaceFormatKHR> {
        let surface_loader = self
            .vulkan
            .surface_loader()
            .ok_or(Error::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(self.vulkan.physical_device(), self.surface)?
        };
        let preferred = if self.config.srgb {
            vk::Format::B8G8R8A8_SRGB
        } else {
            vk::Format::B8G8R8A8_UNORM
        };
        formats
            .iter()
            .find(|f| {
                f.format == preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(Error::Device(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))
    }

    /// Creates a new swapchain, retiring the current one.
    ///
    /// The device must be idle: images of the retired swapchain are destroyed immediately.
    fn rebuild(&mut self) -> Result<()> {
        let vulkan = self.vulkan.clone();
        let (Some(surface_loader), Some(swapchain_loader)) =
            (vulkan.surface_loader(), vulkan.swapchain_loader())
        else {
            return Err(Error::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT));
        };
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(
                vulkan.physical_device(),
                self.surface,
            )?
        };
        let extent = if capabilities.current_extent.width != u32::MAX {
            UVec2::new(
                capabilities.current_extent.width,
                capabilities.current_extent.height,
            )
        } else {
            (self.framebuffer_size)().clamp(
                UVec2::new(
                    capabilities.min_image_extent.width,
                    capabilities.min_image_extent.height,
                ),
                UVec2::new(
                    capabilities.max_image_extent.width,
                    capabilities.max_image_extent.height,
                ),
            )
        };
        if extent.x == 0 || extent.y == 0 {
            // Minimized window. Keep the old swapchain until the window has an area again.
            self.valid = false;
            return Ok(());
        }

        let surface_format = self.choose_surface_format()?;
        let mut min_image_count = self.config.min_image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }
        let old_swapchain = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk::Extent2D {
                width: extent.x,
                height: extent.y,
            })
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let handle = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        self.destroy_images();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.handle = handle;
        self.surface_format = surface_format;
        self.extent = extent;

        let raw_images = unsafe { swapchain_loader.get_swapchain_images(handle)? };
        for image in raw_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { vulkan.device().create_image_view(&view_info, None)? };
            self.images.push(SwapchainImage {
                image,
                view,
                acquire_semaphore: SharedSemaphore::new_binary(self.device.clone())?,
                present_semaphore: SharedSemaphore::new_binary(self.device.clone())?,
            });
        }
        self.valid = true;
        Ok(())
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            unsafe { self.vulkan.device().destroy_image_view(image.view, None) };
        }
    }
}

impl PresentTarget for Swapchain {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        if !self.valid {
            return Err(Error::SurfaceOutOfDate);
        }
        let swapchain_loader = self
            .vulkan
            .swapchain_loader()
            .ok_or(Error::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let result = unsafe {
            swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                self.spare_acquire_semaphore.raw(),
                vk::Fence::null(),
            )
        };
        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.valid = false;
                return Err(Error::SurfaceOutOfDate);
            }
            Err(err) => return Err(err.into()),
        };
        if suboptimal {
            tracing::debug!("Swapchain is suboptimal for the surface");
        }
        let image = &mut self.images[index as usize];
        std::mem::swap(
            &mut image.acquire_semaphore,
            &mut self.spare_acquire_semaphore,
        );
        Ok(AcquiredImage {
            index,
            image: image.image,
            view: image.view,
            extent: self.extent,
            format: self.surface_format.format,
            acquire_semaphore: Some(image.acquire_semaphore.clone()),
            present_semaphore: Some(image.present_semaphore.clone()),
            ready: None,
        })
    }

    fn present(&mut self, image: &AcquiredImage, _rendered: &SyncPoint) -> Result<()> {
        if !self.valid {
            return Err(Error::SurfaceOutOfDate);
        }
        let swapchain_loader = self
            .vulkan
            .swapchain_loader()
            .ok_or(Error::Device(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let present_semaphore = &self.images[image.index as usize].present_semaphore;
        let wait_semaphores = [present_semaphore.raw()];
        let swapchains = [self.handle];
        let image_indices = [image.index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = {
            let queue = self.device.lock_queue(self.device.families().graphics, 0);
            unsafe { swapchain_loader.queue_present(*queue, &present_info) }
        };
        match result {
            // Suboptimal is not an error.
            Ok(_) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.valid = false;
                Err(Error::SurfaceOutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn recreate(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.rebuild()?;
        tracing::info!(
            width = self.extent.x,
            height = self.extent.y,
            format = ?self.surface_format.format,
            color_space = ?self.surface_format.color_space,
            valid = self.valid,
            "Recreated swapchain"
        );
        Ok(())
    }

    fn extent(&self) -> UVec2 {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    fn final_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::PRESENT_SRC_KHR
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            tracing::error!(%err, "Failed to wait for presentation before destroying swapchain");
        }
        self.destroy_images();
        unsafe {
            if let Some(swapchain_loader) = self.vulkan.swapchain_loader() {
                if self.handle != vk::SwapchainKHR::null() {
                    swapchain_loader.destroy_swapchain(self.handle, None);
                }
            }
            if let Some(surface_loader) = self.vulkan.surface_loader() {
                surface_loader.destroy_surface(self.surface, None);
            }
        }
    }
}
