//! Uploading short clips into array images.
//!
//! A preloaded clip is stored in array images, one layer per frame. All frames
//! are written into a single [`StagingBuffer`] and copied with one submission on the transfer
//! family. The staging buffer is handed to the [`TransientPools`] as the operation's payload, so
//! it is freed only after the copy has completed.
//!
//! The resulting planes start out as a copy destination owned by the transfer family. The first
//! consumer on another family triggers an ownership transfer through
//! [`ImagePlane::request_usage`](crate::plane::ImagePlane::request_usage).
//!
//! Staging data is stored plane-major: all layers of plane 0, then all layers of plane 1, and
//! so on. Each plane then needs a single copy region covering every layer.

use std::{any::Any, sync::Arc, time::Duration};

use ash::vk;
use glam::UVec2;
use smallvec::SmallVec;

use crate::{
    HasDevice, Result,
    alloc::{Allocator, DeviceImage, StagingBuffer},
    command::BarrierBatch,
    format::{PixelFormat, VideoFormat},
    plane::{FrameData, ImagePlane, PlaneUsage},
    source::PreloadedSource,
    sync::SyncPoint,
    tracking::Access,
    transient::TransientPools,
};

/// Plane offsets inside the staging buffer are aligned to this many bytes.
const PLANE_ALIGNMENT: u64 = 16;

/// One decoded frame of a clip, as tightly packed plane data.
#[derive(Debug, Clone)]
pub struct ClipFrame<'a> {
    pub planes: SmallVec<[&'a [u8]; 3]>,
    /// Time at which the frame stops being visible.
    pub end: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PlaneSlice {
    offset: u64,
    layer_size: u64,
    extent: UVec2,
    image: usize,
    aspect: vk::ImageAspectFlags,
}

/// Where every plane of every layer goes in the staging buffer.
#[derive(Debug, Clone)]
pub struct UploadLayout {
    layers: u32,
    planes: SmallVec<[PlaneSlice; 3]>,
    image_aspects: SmallVec<[vk::ImageAspectFlags; 3]>,
    size: u64,
}

impl UploadLayout {
    pub fn new(format: &VideoFormat, extent: UVec2, layers: u32) -> Self {
        let mut offset = 0;
        let planes = (0..format.planes)
            .map(|i| {
                let layer_size = format.plane_size(i, extent);
                let slice = PlaneSlice {
                    offset,
                    layer_size,
                    // Packed formats are copied in texels of the image format.
                    extent: if format.images == 1 && !format.is_multiplanar() {
                        extent
                    } else {
                        format.plane_extent(i, extent)
                    },
                    image: if format.is_multiplanar() { 0 } else { i as usize },
                    aspect: format.plane_aspect(i),
                };
                offset = (offset + layer_size * layers as u64).next_multiple_of(PLANE_ALIGNMENT);
                slice
            })
            .collect();
        let image_aspects = if format.is_multiplanar() {
            SmallVec::from_elem(format.aspect, 1)
        } else {
            SmallVec::from_elem(vk::ImageAspectFlags::COLOR, format.images as usize)
        };
        Self {
            layers,
            planes,
            image_aspects,
            size: offset,
        }
    }

    /// Total staging size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn image_count(&self) -> usize {
        self.image_aspects.len()
    }

    /// Bytes of one layer of plane `plane`.
    pub fn plane_size(&self, plane: usize) -> u64 {
        self.planes[plane].layer_size
    }

    /// Staging offset of plane `plane` of layer `layer`.
    pub fn offset(&self, layer: u32, plane: usize) -> u64 {
        assert!(layer < self.layers);
        let slice = &self.planes[plane];
        slice.offset + slice.layer_size * layer as u64
    }

    /// Copy regions targeting image `image`.
    pub fn regions(&self, image: usize) -> SmallVec<[vk::BufferImageCopy; 3]> {
        self.planes
            .iter()
            .filter(|slice| slice.image == image)
            .map(|slice| vk::BufferImageCopy {
                buffer_offset: slice.offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: slice.aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: slice.extent.x,
                    height: slice.extent.y,
                    depth: 1,
                },
            })
            .collect()
    }
}

/// Records and submits the staging copy on `queue_family`.
///
/// `images` are in `UNDEFINED` layout; they end in `TRANSFER_DST_OPTIMAL`. `staging` is kept
/// alive until the copy completes.
pub fn submit_upload(
    pools: &TransientPools,
    queue_family: u32,
    buffer: vk::Buffer,
    images: &[vk::Image],
    layout: &UploadLayout,
    staging: Box<dyn Any + Send>,
) -> Result<SyncPoint> {
    assert_eq!(images.len(), layout.image_count());
    let device = pools.device().clone();
    let cb = pools.begin(queue_family)?;

    let mut batch = BarrierBatch::new();
    for (&image, &aspect) in images.iter().zip(layout.image_aspects.iter()) {
        batch.image_barrier(
            image,
            aspect,
            Access::NONE,
            Access::COPY_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
            0..layout.layers,
        );
    }
    batch.emit(&device, &cb);
    for (i, &image) in images.iter().enumerate() {
        device.cmd_copy_buffer_to_image(
            cb.raw(),
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &layout.regions(i),
        );
    }
    pools.end(cb, Some(staging), &[])
}

/// Plane records for freshly uploaded images.
pub fn uploaded_planes(
    format: &VideoFormat,
    images: &[vk::Image],
    layers: u32,
    queue_family: u32,
    sync: &SyncPoint,
) -> Vec<ImagePlane> {
    (0..format.planes)
        .map(|i| {
            let (image, plane_format) = if format.is_multiplanar() {
                (images[0], format.fallbacks[i as usize])
            } else if format.images == 1 {
                (images[0], format.format)
            } else {
                (images[i as usize], format.fallbacks[i as usize])
            };
            ImagePlane::new(
                image,
                plane_format,
                format.plane_aspect(i),
                layers,
                PlaneUsage::copy_destination(queue_family),
                Some(sync.clone()),
            )
        })
        .collect()
}

/// Uploads a whole clip and returns it as a [`PreloadedSource`].
///
/// Returns as soon as the copy is submitted. Use
/// [`PreloadedSource::wait_for_load`] to block until it has completed; sampling the frames
/// through the plane protocol waits on the GPU instead.
pub fn preload_clip(
    allocator: &Allocator,
    pools: &TransientPools,
    pixel_format: PixelFormat,
    extent: UVec2,
    frames: &[ClipFrame<'_>],
) -> Result<PreloadedSource> {
    assert!(!frames.is_empty(), "Video stream has no frames");
    let format = pixel_format.video_format()?;
    let layers = frames.len() as u32;
    let layout = UploadLayout::new(format, extent, layers);

    let mut staging = StagingBuffer::new(allocator.clone(), layout.size())?;
    for (layer, frame) in frames.iter().enumerate() {
        assert_eq!(frame.planes.len(), format.planes as usize);
        for (plane, data) in frame.planes.iter().enumerate() {
            assert_eq!(
                data.len() as u64,
                layout.plane_size(plane),
                "Plane {plane} of frame {layer} has the wrong size"
            );
            staging.write(layout.offset(layer as u32, plane), data);
        }
    }
    staging.flush()?;

    let usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
    let images: Vec<DeviceImage> = if format.images == 1 {
        vec![DeviceImage::new(
            allocator.clone(),
            format.format,
            extent,
            layers,
            usage,
            format.aspect,
        )?]
    } else {
        (0..format.images)
            .map(|i| {
                DeviceImage::new(
                    allocator.clone(),
                    format.fallbacks[i as usize],
                    format.plane_extent(i, extent),
                    layers,
                    usage,
                    vk::ImageAspectFlags::COLOR,
                )
            })
            .collect::<Result<_>>()?
    };
    let handles: Vec<vk::Image> = images.iter().map(DeviceImage::raw).collect();

    let transfer = pools.device().families().transfer;
    let buffer = staging.raw();
    let sync = submit_upload(pools, transfer, buffer, &handles, &layout, Box::new(staging))?;
    tracing::debug!(
        ?pixel_format,
        frames = layers,
        bytes = layout.size(),
        "Submitted clip upload"
    );

    let planes = uploaded_planes(format, &handles, layers, transfer, &sync);
    let data = FrameData::new(planes, extent, pixel_format).with_backing(Box::new(images));
    Ok(PreloadedSource::new(
        Arc::new(data),
        frames.iter().map(|frame| frame.end).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Device,
        device::QueueFamilies,
        headless::HeadlessBackend,
        plane::FrameDescriptor,
        sync::INFINITE,
    };
    use ash::vk::Handle;

    fn nv12() -> &'static VideoFormat {
        PixelFormat::Nv12.video_format().unwrap()
    }

    #[test]
    fn staging_is_plane_major() {
        let layout = UploadLayout::new(nv12(), UVec2::new(64, 32), 4);
        assert_eq!(layout.plane_size(0), 64 * 32);
        assert_eq!(layout.plane_size(1), 32 * 16 * 2);
        assert_eq!(layout.offset(0, 0), 0);
        assert_eq!(layout.offset(3, 0), 3 * 64 * 32);
        assert_eq!(layout.offset(0, 1), 4 * 64 * 32);
        assert_eq!(layout.offset(1, 1), 4 * 64 * 32 + 32 * 16 * 2);
        assert_eq!(layout.size(), 4 * (64 * 32 + 32 * 16 * 2));
        assert_eq!(layout.image_count(), 1);

        let regions = layout.regions(0);
        assert_eq!(regions.len(), 2);
        assert_eq!(
            regions[1].image_subresource.aspect_mask,
            vk::ImageAspectFlags::PLANE_1
        );
        assert_eq!(regions[1].image_subresource.layer_count, 4);
        assert_eq!(regions[1].image_extent.width, 32);
    }

    #[test]
    fn odd_sizes_are_aligned() {
        let layout = UploadLayout::new(nv12(), UVec2::new(33, 17), 1);
        assert_eq!(layout.plane_size(0), 33 * 17);
        assert_eq!(layout.offset(0, 1) % PLANE_ALIGNMENT, 0);
        assert_eq!(layout.plane_size(1), 17 * 9 * 2);
    }

    #[test]
    fn separate_planes_get_their_own_images() {
        let format = PixelFormat::Gbrp.video_format().unwrap();
        let layout = UploadLayout::new(format, UVec2::new(16, 16), 2);
        assert_eq!(layout.image_count(), 3);
        for image in 0..3 {
            let regions = layout.regions(image);
            assert_eq!(regions.len(), 1);
            assert_eq!(
                regions[0].image_subresource.aspect_mask,
                vk::ImageAspectFlags::COLOR
            );
        }
    }

    #[test]
    fn upload_runs_on_the_transfer_family() {
        let backend = Arc::new(HeadlessBackend::new());
        let families = QueueFamilies {
            graphics: 0,
            compute: 0,
            transfer: 1,
            decode: None,
            encode: None,
        };
        let device = Device::new(backend.clone(), families);
        let pools = TransientPools::new(device.clone());
        let format = nv12();
        let layout = UploadLayout::new(format, UVec2::new(64, 32), 3);
        let image = vk::Image::from_raw(0xbeef);
        let staging = Arc::new(());

        backend.set_hold(true);
        let sync = submit_upload(
            &pools,
            1,
            vk::Buffer::from_raw(0xb0),
            &[image],
            &layout,
            Box::new(staging.clone()),
        )
        .unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.family, 1);
        assert_eq!(submission.copies, 2);
        assert_eq!(submission.barriers.len(), 1);
        assert_eq!(
            submission.barriers[0].new_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(submission.barriers[0].subresource_range.layer_count, 3);

        // The staging payload outlives the pending copy.
        assert_eq!(pools.garbage_collect(0).unwrap(), 0);
        assert_eq!(Arc::strong_count(&staging), 2);
        backend.set_hold(false);
        sync.wait(INFINITE).unwrap();
        assert_eq!(pools.garbage_collect(INFINITE).unwrap(), 1);
        assert_eq!(Arc::strong_count(&staging), 1);
    }

    #[test]
    fn uploaded_frames_transfer_to_graphics_on_first_use() {
        let backend = Arc::new(HeadlessBackend::new());
        let families = QueueFamilies {
            graphics: 0,
            compute: 0,
            transfer: 1,
            decode: None,
            encode: None,
        };
        let device = Device::new(backend.clone(), families);
        let pools = TransientPools::new(device.clone());
        let format = nv12();
        let extent = UVec2::new(64, 32);
        let layout = UploadLayout::new(format, extent, 2);
        let image = vk::Image::from_raw(0xbeef);
        let sync = submit_upload(
            &pools,
            1,
            vk::Buffer::from_raw(0xb0),
            &[image],
            &layout,
            Box::new(()),
        )
        .unwrap();

        let planes = uploaded_planes(format, &[image], 2, 1, &sync);
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(planes[0].queue_family(), 1);
        assert_eq!(planes[1].aspect(), vk::ImageAspectFlags::PLANE_1);
        assert_eq!(planes[1].format(), vk::Format::R8G8_UNORM);

        let data = Arc::new(FrameData::new(planes, extent, PixelFormat::Nv12));
        let mut source = PreloadedSource::new(
            data.clone(),
            vec![Duration::from_millis(40), Duration::from_millis(80)],
        );
        source.wait_for_load(INFINITE).unwrap();
        let FrameDescriptor { data: frame, layer } =
            source.frame_at(Duration::from_millis(50)).unwrap();
        assert_eq!(layer, Some(1));

        let waits = frame.request_usage(&pools, PlaneUsage::sampled(0)).unwrap();
        assert_eq!(waits.len(), 2);
        for i in 0..2 {
            let plane = frame.plane(i);
            assert_eq!(plane.queue_family(), 0);
            assert_eq!(plane.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
    }
}
