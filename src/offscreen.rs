//! Rendering for an encoder instead of a window.
//!
//! [`OffscreenTarget`] is a [`PresentTarget`] backed by a ring of colour images. Presenting an
//! image sends it to the encoder as an [`OffscreenFrame`], together with the sync point that
//! is reached once rendering has finished. The encoder waits on that sync point (on the GPU or
//! the host) before reading the image and drops the frame when it is done with it.
//!
//! A ring entry whose image the encoder still holds is never rendered into again. It is
//! replaced by a freshly allocated image, and the old one is freed when the encoder lets go.
//! A reused entry is not waited on by the host: the next frame rendered into it waits on the
//! previous one's completion through [`AcquiredImage::ready`].

use std::sync::Arc;

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use glam::UVec2;

use crate::{
    Error, Result,
    alloc::{Allocator, DeviceImage},
    present::{AcquiredImage, PresentTarget},
    sync::{INFINITE, SyncPoint},
};

/// An image the offscreen target can render into.
pub trait RenderImage: Send + Sync + 'static {
    fn raw(&self) -> vk::Image;
    fn view(&self) -> vk::ImageView;
}

impl RenderImage for DeviceImage {
    fn raw(&self) -> vk::Image {
        DeviceImage::raw(self)
    }
    fn view(&self) -> vk::ImageView {
        DeviceImage::view(self)
    }
}

type ImageFactory<I> = Box<dyn FnMut(UVec2, vk::Format) -> Result<I> + Send>;

/// A rendered frame handed to the encoder.
pub struct OffscreenFrame<I: RenderImage = DeviceImage> {
    /// Position of the frame in presentation order, starting at 0.
    pub sequence: u64,
    pub image: Arc<I>,
    pub extent: UVec2,
    pub format: vk::Format,
    /// The layout the image was left in.
    pub layout: vk::ImageLayout,
    /// Reached once rendering into `image` has completed.
    pub ready: SyncPoint,
}

struct RingEntry<I> {
    image: Arc<I>,
    /// Completion of the last frame rendered into this entry.
    rendered: Option<SyncPoint>,
}

pub struct OffscreenTarget<I: RenderImage = DeviceImage> {
    factory: ImageFactory<I>,
    ring: Vec<RingEntry<I>>,
    ring_size: usize,
    next: usize,
    sequence: u64,
    extent: UVec2,
    format: vk::Format,
    sender: Sender<OffscreenFrame<I>>,
}

impl OffscreenTarget<DeviceImage> {
    /// Creates a target whose images are allocated with `allocator`, and the receiving end the
    /// encoder reads from. At most `capacity` presented frames are queued before `present`
    /// blocks.
    pub fn new(
        allocator: Allocator,
        extent: UVec2,
        format: vk::Format,
        ring_size: usize,
        capacity: usize,
    ) -> Result<(Self, Receiver<OffscreenFrame<DeviceImage>>)> {
        Self::with_factory(
            move |extent, format| {
                DeviceImage::new(
                    allocator.clone(),
                    format,
                    extent,
                    1,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::SAMPLED,
                    vk::ImageAspectFlags::COLOR,
                )
            },
            extent,
            format,
            ring_size,
            capacity,
        )
    }
}

impl<I: RenderImage> OffscreenTarget<I> {
    pub fn with_factory(
        factory: impl FnMut(UVec2, vk::Format) -> Result<I> + Send + 'static,
        extent: UVec2,
        format: vk::Format,
        ring_size: usize,
        capacity: usize,
    ) -> Result<(Self, Receiver<OffscreenFrame<I>>)> {
        assert!(ring_size > 0);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let mut this = Self {
            factory: Box::new(factory),
            ring: Vec::with_capacity(ring_size),
            ring_size,
            next: 0,
            sequence: 0,
            extent,
            format,
            sender,
        };
        this.fill_ring()?;
        Ok((this, receiver))
    }

    fn fill_ring(&mut self) -> Result<()> {
        // Old images may still be rendered into.
        for entry in self.ring.drain(..) {
            if let Some(rendered) = entry.rendered {
                rendered.wait(INFINITE)?;
            }
        }
        for _ in 0..self.ring_size {
            let image = (self.factory)(self.extent, self.format)?;
            self.ring.push(RingEntry {
                image: Arc::new(image),
                rendered: None,
            });
        }
        self.next = 0;
        Ok(())
    }

    /// Changes the output size. Images are reallocated on the next [`recreate`](PresentTarget::recreate).
    pub fn resize(&mut self, extent: UVec2) {
        self.extent = extent;
    }

    /// Number of frames presented so far.
    pub fn presented(&self) -> u64 {
        self.sequence
    }
}

impl<I: RenderImage> PresentTarget for OffscreenTarget<I> {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        let index = self.next;
        self.next = (self.next + 1) % self.ring.len();
        let entry = &mut self.ring[index];
        if Arc::strong_count(&entry.image) > 1 {
            tracing::debug!(index, "Encoder still holds offscreen image, replacing it");
            entry.image = Arc::new((self.factory)(self.extent, self.format)?);
            entry.rendered = None;
        }
        Ok(AcquiredImage {
            index: index as u32,
            image: entry.image.raw(),
            view: entry.image.view(),
            extent: self.extent,
            format: self.format,
            acquire_semaphore: None,
            present_semaphore: None,
            ready: entry.rendered.clone(),
        })
    }

    fn present(&mut self, image: &AcquiredImage, rendered: &SyncPoint) -> Result<()> {
        let entry = &mut self.ring[image.index as usize];
        assert_eq!(entry.image.raw(), image.image, "Presented image is not from this target");
        entry.rendered = Some(rendered.clone());
        let frame = OffscreenFrame {
            sequence: self.sequence,
            image: entry.image.clone(),
            extent: image.extent,
            format: image.format,
            layout: self.final_layout(),
            ready: rendered.clone(),
        };
        self.sequence += 1;
        self.sender.send(frame).map_err(|_| Error::Disconnected)
    }

    /// Blocks until every frame rendered into the old images has completed, then reallocates
    /// the ring.
    fn recreate(&mut self) -> Result<()> {
        self.fill_ring()?;
        tracing::info!(
            width = self.extent.x,
            height = self.extent.y,
            format = ?self.format,
            "Recreated offscreen target"
        );
        Ok(())
    }

    fn extent(&self) -> UVec2 {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn final_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Device,
        device::QueueFamilies,
        frame::{FramePacer, FrameStatus, PacerConfig},
        headless::HeadlessBackend,
        transient::TransientPools,
    };
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct FakeImage(u64, Option<Log>);
    impl Drop for FakeImage {
        fn drop(&mut self) {
            if let Some(log) = &self.1 {
                log.lock().push("dropped");
            }
        }
    }
    impl RenderImage for FakeImage {
        fn raw(&self) -> vk::Image {
            vk::Image::from_raw(self.0)
        }
        fn view(&self) -> vk::ImageView {
            vk::ImageView::from_raw(self.0)
        }
    }

    fn target(
        ring_size: usize,
    ) -> (
        OffscreenTarget<FakeImage>,
        Receiver<OffscreenFrame<FakeImage>>,
        Arc<AtomicU64>,
    ) {
        let allocated = Arc::new(AtomicU64::new(0));
        let counter = allocated.clone();
        let (target, receiver) = OffscreenTarget::with_factory(
            move |_, _| Ok(FakeImage(0x1000 + counter.fetch_add(1, Ordering::SeqCst), None)),
            UVec2::new(64, 32),
            vk::Format::R8G8B8A8_UNORM,
            ring_size,
            8,
        )
        .unwrap();
        (target, receiver, allocated)
    }

    #[test]
    fn frames_reach_the_encoder_in_order() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), QueueFamilies::single(0));
        let pools = Arc::new(TransientPools::new(device.clone()));
        let (target, receiver, _) = target(3);
        let mut pacer = FramePacer::new(device, target, pools, PacerConfig::default()).unwrap();
        for _ in 0..4 {
            let frame = pacer.begin_frame().unwrap();
            assert_eq!(frame.finish().unwrap(), FrameStatus::Presented);
        }
        let frames: Vec<_> = receiver.try_iter().collect();
        assert_eq!(frames.len(), 4);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, i as u64);
            assert_eq!(frame.ready.value, i as u64 + 1);
            assert_eq!(frame.layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            frame.ready.wait(INFINITE).unwrap();
        }
    }

    #[test]
    fn held_images_are_replaced() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), QueueFamilies::single(0));
        let pools = Arc::new(TransientPools::new(device.clone()));
        let (target, receiver, allocated) = target(2);
        let mut pacer = FramePacer::new(device, target, pools, PacerConfig::default()).unwrap();
        assert_eq!(allocated.load(Ordering::SeqCst), 2);

        pacer.begin_frame().unwrap().finish().unwrap();
        let held = receiver.try_recv().unwrap();
        pacer.begin_frame().unwrap().finish().unwrap();
        drop(receiver.try_recv().unwrap());

        // Ring entry 0 is still held by the encoder.
        let frame = pacer.begin_frame().unwrap();
        assert_ne!(frame.image().image, held.image.raw());
        frame.finish().unwrap();
        assert_eq!(allocated.load(Ordering::SeqCst), 3);

        // Entry 1 was released and is reused as is.
        drop(held);
        let frame = pacer.begin_frame().unwrap();
        assert_eq!(frame.image().image, vk::Image::from_raw(0x1001));
        frame.finish().unwrap();
        assert_eq!(allocated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn disconnected_encoder_is_reported() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), QueueFamilies::single(0));
        let pools = Arc::new(TransientPools::new(device.clone()));
        let (target, receiver, _) = target(2);
        drop(receiver);
        let mut pacer = FramePacer::new(device, target, pools, PacerConfig::default()).unwrap();
        let frame = pacer.begin_frame().unwrap();
        assert!(matches!(frame.finish(), Err(Error::Disconnected)));
    }

    #[test]
    fn reused_entries_wait_on_the_gpu() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), QueueFamilies::single(0));
        let pools = Arc::new(TransientPools::new(device.clone()));
        let (target, receiver, _) = target(1);
        let mut pacer = FramePacer::new(device, target, pools, PacerConfig::default()).unwrap();
        backend.set_hold(true);

        pacer.begin_frame().unwrap().finish().unwrap();
        let first = receiver.try_recv().unwrap();
        let ready = first.ready.clone();
        drop(first);
        assert!(!ready.is_reached().unwrap());

        // Acquiring the same entry again returns without waiting for frame 0.
        let frame = pacer.begin_frame().unwrap();
        assert_eq!(frame.image().ready.as_ref(), Some(&ready));
        frame.finish().unwrap();
        let submissions = backend.submissions();
        assert!(submissions[1].waits_on(ready.semaphore.raw(), ready.value));

        backend.set_hold(false);
        assert!(ready.is_reached().unwrap());
    }

    #[test]
    fn recreate_waits_for_frames_in_flight() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), QueueFamilies::single(0));
        let pools = Arc::new(TransientPools::new(device.clone()));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let factory_log = log.clone();
        let mut next = 0x1000;
        let (target, receiver) = OffscreenTarget::with_factory(
            move |_, _| {
                next += 1;
                Ok(FakeImage(next, Some(factory_log.clone())))
            },
            UVec2::new(64, 32),
            vk::Format::R8G8B8A8_UNORM,
            2,
            8,
        )
        .unwrap();
        let mut pacer = FramePacer::new(device, target, pools, PacerConfig::default()).unwrap();
        backend.set_hold(true);

        pacer.begin_frame().unwrap().finish().unwrap();
        let frame = receiver.try_recv().unwrap();
        let ready = frame.ready.clone();
        drop(frame);
        assert!(!ready.is_reached().unwrap());

        let release = {
            let backend = backend.clone();
            let log = log.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                log.lock().push("completed");
                backend.set_hold(false);
            })
        };
        pacer.target_mut().resize(UVec2::new(128, 64));
        pacer.target_mut().recreate().unwrap();
        release.join().unwrap();

        assert!(ready.is_reached().unwrap());
        assert_eq!(*log.lock(), ["completed", "dropped", "dropped"]);
    }
}
