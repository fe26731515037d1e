//! GPU memory allocation.
//!
//! [`Allocator`] wraps the Vulkan Memory Allocator (VMA) for the Vulkan backend. It is used by
//! the helpers that own GPU memory: the [upload path](crate::upload) and the
//! [offscreen target](crate::offscreen).
//!
//! - [`StagingBuffer`] is a persistently mapped, host-visible transfer source.
//! - [`DeviceImage`] is a device-local 2D (array) image with a default view.

use std::{fmt::Debug, ops::Deref, sync::Arc};

use ash::vk;
use glam::UVec2;
use vk_mem::Alloc;

use crate::{Device, HasDevice, Result, vulkan::VulkanBackend};

/// A GPU memory allocator using the Vulkan Memory Allocator (VMA) library.
///
/// Reference-counted and cheap to clone.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);

struct AllocatorInner {
    // Dropped before the backend that owns the device.
    inner: vk_mem::Allocator,
    vulkan: Arc<VulkanBackend>,
    device: Device,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Allocator {
    pub fn new(vulkan: Arc<VulkanBackend>, device: Device) -> Result<Self> {
        let info = vk_mem::AllocatorCreateInfo::new(
            vulkan.instance(),
            vulkan.device(),
            vulkan.physical_device(),
        );
        let inner = unsafe { vk_mem::Allocator::new(info)? };
        Ok(Self(Arc::new(AllocatorInner {
            inner,
            vulkan,
            device,
        })))
    }

    pub fn vulkan(&self) -> &Arc<VulkanBackend> {
        &self.0.vulkan
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}

/// A host-visible buffer used as a transfer source.
pub struct StagingBuffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    mapped: *mut u8,
}
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl StagingBuffer {
    pub fn new(allocator: Allocator, size: vk::DeviceSize) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::MAPPED
                | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let (buffer, mut allocation) = unsafe {
            allocator
                .create_buffer(&buffer_info, &allocation_info)
                .map_err(crate::Error::Allocation)?
        };
        let mapped = allocator.get_allocation_info(&allocation).mapped_data as *mut u8;
        if mapped.is_null() {
            unsafe { allocator.destroy_buffer(buffer, &mut allocation) };
            return Err(crate::Error::Allocation(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        Ok(Self {
            allocator,
            allocation,
            buffer,
            size,
            mapped,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) {
        assert!(
            offset + data.len() as vk::DeviceSize <= self.size,
            "Staging write out of bounds"
        );
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add(offset as usize),
                data.len(),
            );
        }
    }

    /// Makes host writes visible to the device. No-op on coherent memory.
    pub fn flush(&self) -> Result<()> {
        self.allocator
            .flush_allocation(&self.allocation, 0, self.size)?;
        Ok(())
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

/// A device-local 2D image. Colour images get a default view covering every layer.
pub struct DeviceImage {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: UVec2,
    array_layers: u32,
}
unsafe impl Send for DeviceImage {}
unsafe impl Sync for DeviceImage {}

impl Debug for DeviceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceImage")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("array_layers", &self.array_layers)
            .finish_non_exhaustive()
    }
}

impl DeviceImage {
    /// Allocates an exclusively shared image in `UNDEFINED` layout.
    pub fn new(
        allocator: Allocator,
        format: vk::Format,
        extent: UVec2,
        array_layers: u32,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.x,
                height: extent.y,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe {
            allocator
                .create_image(&image_info, &allocation_info)
                .map_err(crate::Error::Allocation)?
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(if array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: array_layers,
            });
        // Multi-planar images are sampled through per-plane views created by the renderer.
        let view = if aspect == vk::ImageAspectFlags::COLOR {
            match unsafe { allocator.vulkan().device().create_image_view(&view_info, None) } {
                Ok(view) => view,
                Err(err) => {
                    unsafe { allocator.destroy_image(image, &mut allocation) };
                    return Err(err.into());
                }
            }
        } else {
            vk::ImageView::null()
        };
        Ok(Self {
            allocator,
            allocation,
            image,
            view,
            format,
            extent,
            array_layers,
        })
    }

    pub fn raw(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.allocator
                    .vulkan()
                    .device()
                    .destroy_image_view(self.view, None);
            }
            self.allocator.destroy_image(self.image, &mut self.allocation);
        }
    }
}
