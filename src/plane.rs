//! Image planes and their ownership protocol.
//!
//! An [`ImagePlane`] is one GPU image (or one image of a multi-image frame) together with a
//! record of what the GPU will have done to it by the time its [`SyncPoint`] is reached: the
//! layout it will be in, the queue family that will own it, and the accesses that touched it.
//!
//! The record is a promise about future GPU state. It is only changed by
//! [`ImagePlane::request_usage`], which submits the barriers that make the promise true, so the
//! record and the submitted work can never disagree.
//!
//! # Ownership transfer
//!
//! When the desired queue family differs from the owning one, the plane goes through a release
//! on the owning family followed by an acquire on the desired family:
//!
//! ```text
//!   owner family           desired family
//!   ------------           --------------
//!   wait(plane sync)
//!   release barrier  ---->  wait(release signal)
//!   signal S1               acquire barrier
//!                           signal S2  ----> new plane sync
//! ```
//!
//! A plane whose layout already matches but whose owner differs still goes through both steps.

use std::{any::Any, fmt::Debug, sync::Arc};

use ash::vk;
use glam::UVec2;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::{
    HasDevice, Result,
    command::BarrierBatch,
    format::PixelFormat,
    sync::SyncPoint,
    tracking::{Access, ResourceState},
    transient::TransientPools,
};

/// How a consumer is about to use a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneUsage {
    pub layout: vk::ImageLayout,
    /// The family the consumer executes on.
    pub queue_family: u32,
    pub access: Access,
}

impl PlaneUsage {
    /// Sampled from a fragment shader.
    pub fn sampled(queue_family: u32) -> Self {
        Self {
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            queue_family,
            access: Access::FRAGMENT_SAMPLED_READ,
        }
    }

    /// Used as the source of a blit.
    pub fn blit_source(queue_family: u32) -> Self {
        Self {
            layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            queue_family,
            access: Access::BLIT_SRC,
        }
    }

    /// Written by a buffer-to-image copy.
    pub fn copy_destination(queue_family: u32) -> Self {
        Self {
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            queue_family,
            access: Access::COPY_WRITE,
        }
    }
}

/// A GPU image with a tracked layout, owner and synchronization point.
pub struct ImagePlane {
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    array_layers: u32,
    state: ResourceState,
    sync: Option<SyncPoint>,
}

impl Debug for ImagePlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePlane")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("sync", &self.sync.as_ref().map(|s| s.value))
            .finish()
    }
}

impl ImagePlane {
    /// Wraps an image as its producer left it.
    ///
    /// `produced` describes the producer's last use, and `sync` is reached once that use has
    /// completed. Pass [`vk::QUEUE_FAMILY_IGNORED`] as the family for images with no queue
    /// affinity yet.
    pub fn new(
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        array_layers: u32,
        produced: PlaneUsage,
        sync: Option<SyncPoint>,
    ) -> Self {
        Self {
            image,
            format,
            aspect,
            array_layers,
            state: ResourceState::new(produced.access, produced.layout, produced.queue_family),
            sync,
        }
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }
    pub fn format(&self) -> vk::Format {
        self.format
    }
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }
    pub fn layout(&self) -> vk::ImageLayout {
        self.state.layout
    }
    /// The owning queue family, or [`vk::QUEUE_FAMILY_IGNORED`].
    pub fn queue_family(&self) -> u32 {
        self.state.queue_family
    }
    pub fn last_access(&self) -> Access {
        self.state.last_access()
    }
    /// The point at which the recorded state becomes true.
    pub fn sync_point(&self) -> Option<&SyncPoint> {
        self.sync.as_ref()
    }

    /// Brings the plane into the `desired` state.
    ///
    /// Submits whatever barriers are needed through `pools` and returns the point the
    /// consumer's own submission must wait on. When the plane is already in the desired state
    /// no GPU work is issued, but the existing sync point is still returned and must still be
    /// waited on.
    pub fn request_usage(
        &mut self,
        pools: &TransientPools,
        desired: PlaneUsage,
    ) -> Result<Option<SyncPoint>> {
        assert_ne!(
            desired.queue_family,
            vk::QUEUE_FAMILY_IGNORED,
            "A consumer must name the queue family it runs on"
        );
        let owner = self.state.queue_family;
        let same_family = owner == desired.queue_family || owner == vk::QUEUE_FAMILY_IGNORED;

        if same_family && self.state.layout == desired.layout {
            return Ok(self.sync.clone());
        }

        let old_layout = self.state.layout;
        let mut next = self.state.clone();
        let mut barrier = next.transition(desired.access, true);
        if self.sync.is_some() && barrier.src.stage.is_empty() {
            // The barrier has to come after the semaphore wait.
            barrier.src.stage = vk::PipelineStageFlags2::ALL_COMMANDS;
        }
        let waits: SmallVec<[vk::SemaphoreSubmitInfo<'static>; 1]> = self
            .sync
            .iter()
            .map(|sync| sync.wait_info(barrier.src.stage))
            .collect();
        let layers = 0..self.array_layers;
        let device = pools.device().clone();

        let signal = if same_family {
            let cb = pools.begin(desired.queue_family)?;
            let mut batch = BarrierBatch::new();
            batch.image_barrier(
                self.image,
                self.aspect,
                barrier.src,
                barrier.dst,
                old_layout,
                desired.layout,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
                layers,
            );
            batch.emit(&device, &cb);
            pools.end(cb, None, &waits)?
        } else {
            tracing::trace!(
                image = ?self.image,
                from = owner,
                to = desired.queue_family,
                "Transferring plane ownership"
            );
            let release_cb = pools.begin(owner)?;
            let mut batch = BarrierBatch::new();
            batch.image_barrier(
                self.image,
                self.aspect,
                barrier.src,
                Access::NONE,
                old_layout,
                desired.layout,
                owner,
                desired.queue_family,
                layers.clone(),
            );
            batch.emit(&device, &release_cb);
            let released = pools.end(release_cb, None, &waits)?;

            let acquire_cb = pools.begin(desired.queue_family)?;
            batch.image_barrier(
                self.image,
                self.aspect,
                Access::NONE,
                barrier.dst,
                old_layout,
                desired.layout,
                owner,
                desired.queue_family,
                layers,
            );
            batch.emit(&device, &acquire_cb);
            let dst_stage = if barrier.dst.stage.is_empty() {
                vk::PipelineStageFlags2::ALL_COMMANDS
            } else {
                barrier.dst.stage
            };
            pools.end(acquire_cb, None, &[released.wait_info(dst_stage)])?
        };

        next.layout = desired.layout;
        next.queue_family = desired.queue_family;
        self.state = next;
        self.sync = Some(signal.clone());
        Ok(Some(signal))
    }

    /// Records that a submission which waited on this plane's sync point has used the plane
    /// with `access`, completing at `sync`.
    pub(crate) fn retire(&mut self, access: Access, sync: SyncPoint) {
        self.state.transition(access, false);
        self.sync = Some(sync);
    }
}

/// The planes of one decoded frame, plus whatever keeps their memory alive.
pub struct FrameData {
    planes: SmallVec<[Mutex<ImagePlane>; 3]>,
    extent: UVec2,
    pixel_format: PixelFormat,
    backing: Option<Box<dyn Any + Send + Sync>>,
}

impl FrameData {
    pub fn new(
        planes: impl IntoIterator<Item = ImagePlane>,
        extent: UVec2,
        pixel_format: PixelFormat,
    ) -> Self {
        Self {
            planes: planes.into_iter().map(Mutex::new).collect(),
            extent,
            pixel_format,
            backing: None,
        }
    }

    /// Attaches the object that owns the planes' memory, e.g. a decoder surface or an
    /// allocation. It is dropped together with the frame data.
    pub fn with_backing(mut self, backing: Box<dyn Any + Send + Sync>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn backing(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.backing.as_deref()
    }

    pub fn plane(&self, index: usize) -> MutexGuard<'_, ImagePlane> {
        self.planes[index].lock()
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn plane_formats(&self) -> SmallVec<[vk::Format; 3]> {
        self.planes.iter().map(|plane| plane.lock().format()).collect()
    }

    /// Requests the same usage for every plane. Returns the points to wait on.
    pub fn request_usage(
        &self,
        pools: &TransientPools,
        desired: PlaneUsage,
    ) -> Result<SmallVec<[SyncPoint; 3]>> {
        let mut waits = SmallVec::new();
        for plane in self.planes.iter() {
            if let Some(sync) = plane.lock().request_usage(pools, desired)? {
                waits.push(sync);
            }
        }
        Ok(waits)
    }

    pub(crate) fn retire(&self, access: Access, sync: &SyncPoint) {
        for plane in self.planes.iter() {
            plane.lock().retire(access, sync.clone());
        }
    }
}

/// What a [frame source](crate::source::FrameSource) hands to the renderer.
#[derive(Clone)]
pub struct FrameDescriptor {
    pub data: Arc<FrameData>,
    /// For preloaded clips, the array layer holding this frame.
    pub layer: Option<u32>,
}

impl Debug for FrameDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("planes", &self.data.plane_count())
            .field("extent", &self.data.extent)
            .field("layer", &self.layer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Device, device::QueueFamilies, headless::HeadlessBackend, sync::SharedSemaphore,
    };
    use ash::vk::Handle;

    const GRAPHICS: u32 = 0;
    const TRANSFER: u32 = 1;
    const DECODE: u32 = 2;

    fn setup() -> (Device, Arc<HeadlessBackend>, TransientPools) {
        let backend = Arc::new(HeadlessBackend::new());
        let families = QueueFamilies {
            graphics: GRAPHICS,
            compute: GRAPHICS,
            transfer: TRANSFER,
            decode: Some(DECODE),
            encode: None,
        };
        let device = Device::new(backend.clone(), families);
        let pools = TransientPools::new(device.clone());
        (device, backend, pools)
    }

    fn decoded_plane(device: &Device, layout: vk::ImageLayout, access: Access) -> ImagePlane {
        let decoded = SyncPoint::new(SharedSemaphore::new(device.clone(), 1).unwrap(), 1);
        ImagePlane::new(
            vk::Image::from_raw(0xD0),
            vk::Format::G8_B8R8_2PLANE_420_UNORM,
            vk::ImageAspectFlags::PLANE_0 | vk::ImageAspectFlags::PLANE_1,
            1,
            PlaneUsage {
                layout,
                queue_family: DECODE,
                access,
            },
            Some(decoded),
        )
    }

    #[test]
    fn decode_to_graphics_transfer() {
        let (device, backend, pools) = setup();
        let mut plane = decoded_plane(&device, vk::ImageLayout::UNDEFINED, Access::NONE);
        let decoded = plane.sync_point().cloned().unwrap();

        let signal = plane
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap()
            .unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 2);

        let release = &submissions[0];
        assert_eq!(release.family, DECODE);
        assert!(release.waits_on(decoded.semaphore.raw(), decoded.value));
        assert_eq!(release.barriers.len(), 1);
        let b = &release.barriers[0];
        assert!(b.is_release(DECODE));
        assert_eq!(b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(b.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(b.dst_queue_family_index, GRAPHICS);

        let acquire = &submissions[1];
        assert_eq!(acquire.family, GRAPHICS);
        let (s1, v1) = release.signals[0];
        assert!(acquire.waits_on(s1, v1));
        assert_eq!(acquire.barriers.len(), 1);
        let b = &acquire.barriers[0];
        assert!(b.is_acquire(GRAPHICS));
        assert_eq!(b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(b.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(b.src_queue_family_index, DECODE);
        assert_eq!(b.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);

        assert_eq!(plane.queue_family(), GRAPHICS);
        assert_eq!(plane.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(
            plane
                .last_access()
                .stage
                .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER)
        );
        assert_eq!(plane.sync_point(), Some(&signal));
        assert_eq!(acquire.signals(signal.semaphore.raw()), Some(signal.value));
        assert!(signal.is_reached().unwrap());
    }

    #[test]
    fn repeated_request_is_idempotent() {
        let (device, backend, pools) = setup();
        let mut plane = decoded_plane(
            &device,
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            Access::VIDEO_DECODE_WRITE,
        );
        let first = plane
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap();
        let submitted = backend.submissions().len();
        let second = plane
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap();
        assert_eq!(backend.submissions().len(), submitted);
        assert!(second.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn layout_change_on_owner_is_one_barrier() {
        let (device, backend, pools) = setup();
        let produced = SyncPoint::new(SharedSemaphore::new(device.clone(), 0).unwrap(), 3);
        let mut plane = ImagePlane::new(
            vk::Image::from_raw(0xA0),
            vk::Format::R8_UNORM,
            vk::ImageAspectFlags::COLOR,
            4,
            PlaneUsage::copy_destination(GRAPHICS),
            Some(produced.clone()),
        );
        let signal = plane
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap()
            .unwrap();
        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].family, GRAPHICS);
        assert!(submissions[0].waits_on(produced.semaphore.raw(), 3));
        let b = &submissions[0].barriers[0];
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(b.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);
        assert_eq!(b.subresource_range.layer_count, 4);
        // The producer has not finished, so neither has the transition.
        assert!(!signal.is_reached().unwrap());
        produced.semaphore.signal(3).unwrap();
        assert!(signal.is_reached().unwrap());
    }

    #[test]
    fn unowned_plane_is_claimed_without_transfer() {
        let (_device, backend, pools) = setup();
        let mut plane = ImagePlane::new(
            vk::Image::from_raw(0xB0),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageAspectFlags::COLOR,
            1,
            PlaneUsage {
                layout: vk::ImageLayout::UNDEFINED,
                queue_family: vk::QUEUE_FAMILY_IGNORED,
                access: Access::NONE,
            },
            None,
        );
        assert!(
            plane
                .request_usage(&pools, PlaneUsage::copy_destination(TRANSFER))
                .unwrap()
                .is_some()
        );
        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].family, TRANSFER);
        assert!(submissions[0].waits.is_empty());
        assert_eq!(plane.queue_family(), TRANSFER);
    }

    #[test]
    fn matching_layout_on_other_family_still_transfers() {
        let (device, backend, pools) = setup();
        let mut plane = decoded_plane(
            &device,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::VIDEO_DECODE_WRITE,
        );
        plane
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap();
        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(submissions[0].barriers[0].is_release(DECODE));
        assert!(submissions[1].barriers[0].is_acquire(GRAPHICS));
        assert_eq!(
            submissions[1].barriers[0].old_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(plane.queue_family(), GRAPHICS);
    }

    #[test]
    fn frame_data_collects_waits() {
        let (device, _backend, pools) = setup();
        let frame = FrameData::new(
            [
                decoded_plane(&device, vk::ImageLayout::UNDEFINED, Access::NONE),
                decoded_plane(&device, vk::ImageLayout::UNDEFINED, Access::NONE),
            ],
            UVec2::new(16, 16),
            PixelFormat::Nv12,
        );
        let waits = frame
            .request_usage(&pools, PlaneUsage::sampled(GRAPHICS))
            .unwrap();
        assert_eq!(waits.len(), 2);
        assert_ne!(waits[0].semaphore, waits[1].semaphore);
        assert_eq!(frame.plane_formats().len(), 2);
        assert_eq!(frame.plane(1).queue_family(), GRAPHICS);
    }
}
