//! Frames in flight.
//!
//! [`FramePacer`] lets the CPU record up to `N` frames ahead of the GPU. Frame `i` uses slot
//! `i mod N`, which owns a command pool, a command buffer, a timeline semaphore and a list of
//! objects the frame's GPU work depends on.
//!
//! # Frame lifecycle
//!
//! 1. [`begin_frame`](FramePacer::begin_frame) waits until the slot's previous occupant, frame
//!    `i - N`, has completed, then releases that frame's dependencies and acquires an image from
//!    the [`PresentTarget`]. An out-of-date target is recreated and acquisition retried.
//! 2. The returned [`Frame`] collects plane waits ([`sample`](Frame::sample)), extra waits and
//!    retained objects while the renderer records into its command buffer.
//! 3. [`finish`](Frame::finish) submits once, waiting on everything collected and signaling the
//!    slot's semaphore to `i + 1`, then presents.
//!
//! Timeline values are `frame index + 1` so that a fresh semaphore at 0 means "no occupant".
//!
//! # Shutdown
//!
//! Submitted work cannot be cancelled, so dropping the pacer waits for the device to go idle
//! before any slot resource is released. [`FramePacer::shutdown`] does the same but reports
//! errors.

use std::{any::Any, sync::Arc};

use ash::vk;
use serde::Deserialize;

use crate::{
    Device, Error, HasDevice, Result,
    command::{BarrierBatch, CommandBuffer, CommandPool},
    plane::{FrameData, FrameDescriptor, PlaneUsage},
    present::{AcquiredImage, PresentTarget},
    sync::{INFINITE, SharedSemaphore, SyncPoint},
    tracking::{Access, ResourceState},
    transient::TransientPools,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// How long `begin_frame` waits for a slot, in nanoseconds.
    pub frame_timeout: u64,
    /// Acquire attempts before an out-of-date target is reported to the caller.
    pub max_acquire_attempts: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            frame_timeout: INFINITE,
            max_acquire_attempts: 4,
        }
    }
}

/// What happened to a finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The target went out of date while presenting and was recreated. The GPU work was still
    /// submitted.
    Dropped,
}

struct FrameSlot {
    pool: CommandPool,
    command_buffer: CommandBuffer,
    semaphore: SharedSemaphore,
    /// Value the last occupant signals. 0 if the slot was never used.
    target_value: u64,
    dependencies: Vec<Box<dyn Any + Send>>,
}

pub struct FramePacer<T: PresentTarget> {
    device: Device,
    target: T,
    pools: Arc<TransientPools>,
    slots: Vec<FrameSlot>,
    frame_index: u64,
    config: PacerConfig,
}

impl<T: PresentTarget> HasDevice for FramePacer<T> {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl<T: PresentTarget> FramePacer<T> {
    pub fn new(
        device: Device,
        target: T,
        pools: Arc<TransientPools>,
        config: PacerConfig,
    ) -> Result<Self> {
        assert!(config.frames_in_flight > 0, "Need at least one frame in flight");
        assert!(config.max_acquire_attempts > 0);
        let family = device.families().graphics;
        let slots = (0..config.frames_in_flight)
            .map(|_| -> Result<FrameSlot> {
                let mut pool = CommandPool::new(device.clone(), family)?;
                let command_buffer = pool.alloc()?;
                Ok(FrameSlot {
                    pool,
                    command_buffer,
                    semaphore: SharedSemaphore::new(device.clone(), 0)?,
                    target_value: 0,
                    dependencies: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            device,
            target,
            pools,
            slots,
            frame_index: 0,
            config,
        })
    }

    /// Index of the next frame to begin.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn pools(&self) -> &Arc<TransientPools> {
        &self.pools
    }

    /// The point at which frame `index` completes, if it has been submitted and its slot not
    /// yet reused.
    pub fn completion(&self, index: u64) -> Option<SyncPoint> {
        let slot = &self.slots[(index % self.slots.len() as u64) as usize];
        (slot.target_value == index + 1)
            .then(|| SyncPoint::new(slot.semaphore.clone(), slot.target_value))
    }

    fn acquire(&mut self) -> Result<AcquiredImage> {
        let mut attempt = 1;
        loop {
            match self.target.acquire() {
                Ok(image) => return Ok(image),
                Err(Error::SurfaceOutOfDate) if attempt < self.config.max_acquire_attempts => {
                    tracing::info!(attempt, "Present target out of date, recreating");
                    self.target.recreate()?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Starts frame [`frame_index`](Self::frame_index).
    ///
    /// Blocks until the frame that last used this slot has completed on the GPU. A timeout is
    /// reported as [`Error::Timeout`] and leaves the pacer unchanged.
    pub fn begin_frame(&mut self) -> Result<Frame<'_, T>> {
        self.pools.garbage_collect(0)?;

        let index = self.frame_index;
        let slot_index = (index % self.slots.len() as u64) as usize;
        {
            let slot = &mut self.slots[slot_index];
            if slot.target_value > 0 {
                slot.semaphore
                    .wait(slot.target_value, self.config.frame_timeout)?;
                slot.command_buffer.mark_completed();
            }
            slot.dependencies.clear();
        }

        let image = self.acquire()?;

        let slot = &mut self.slots[slot_index];
        slot.pool.reset(&mut [&mut slot.command_buffer])?;
        slot.pool.begin(&mut slot.command_buffer)?;

        // The previous contents of the image are discarded.
        let mut target_state = ResourceState::default();
        let mut barrier = target_state.transition(Access::COLOR_ATTACHMENT_WRITE, true);
        barrier.src.stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        let mut batch = BarrierBatch::new();
        batch.image_barrier(
            image.image,
            vk::ImageAspectFlags::COLOR,
            barrier.src,
            barrier.dst,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
            0..1,
        );
        batch.emit(&self.device, &slot.command_buffer);

        Ok(Frame {
            pacer: self,
            index,
            slot: slot_index,
            image,
            target_state,
            waits: Vec::new(),
            sampled: Vec::new(),
            retained: Vec::new(),
            finished: false,
        })
    }

    /// Waits for all submitted work and releases every slot's dependencies.
    pub fn shutdown(mut self) -> Result<()> {
        self.device.wait_idle()?;
        for slot in self.slots.iter_mut() {
            slot.dependencies.clear();
        }
        Ok(())
    }
}

impl<T: PresentTarget> Drop for FramePacer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            tracing::error!(%err, "Failed to wait for in-flight frames before teardown");
        }
    }
}

/// A frame being recorded. Obtained from [`FramePacer::begin_frame`].
pub struct Frame<'a, T: PresentTarget> {
    pacer: &'a mut FramePacer<T>,
    index: u64,
    slot: usize,
    image: AcquiredImage,
    target_state: ResourceState,
    waits: Vec<vk::SemaphoreSubmitInfo<'static>>,
    sampled: Vec<(Arc<FrameData>, Access)>,
    retained: Vec<Box<dyn Any + Send>>,
    finished: bool,
}

impl<T: PresentTarget> Frame<'_, T> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &AcquiredImage {
        &self.image
    }

    pub fn device(&self) -> &Device {
        &self.pacer.device
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.pacer.slots[self.slot].command_buffer
    }

    /// Records commands into the frame's command buffer.
    pub fn record<R>(
        &mut self,
        f: impl FnOnce(&Device, &CommandBuffer, &AcquiredImage) -> R,
    ) -> R {
        let slot = &self.pacer.slots[self.slot];
        f(&self.pacer.device, &slot.command_buffer, &self.image)
    }

    /// Brings every plane of `frame` into `layout` on the graphics family and makes the
    /// submission wait for it. The frame data is kept alive until the GPU is done with it.
    pub fn use_planes(
        &mut self,
        frame: &FrameDescriptor,
        layout: vk::ImageLayout,
        access: Access,
    ) -> Result<()> {
        let usage = PlaneUsage {
            layout,
            queue_family: self.pacer.device.families().graphics,
            access,
        };
        let waits = frame.data.request_usage(&self.pacer.pools, usage)?;
        self.waits
            .extend(waits.iter().map(|sync| sync.wait_info(access.stage)));
        self.sampled.push((frame.data.clone(), access));
        Ok(())
    }

    /// [`use_planes`](Self::use_planes) for sampling in a fragment shader.
    pub fn sample(&mut self, frame: &FrameDescriptor) -> Result<()> {
        self.use_planes(
            frame,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SAMPLED_READ,
        )
    }

    /// Makes the submission wait for `sync` before `stage`.
    pub fn wait(&mut self, sync: &SyncPoint, stage: vk::PipelineStageFlags2) {
        self.waits.push(sync.wait_info(stage));
        self.retained.push(Box::new(sync.semaphore.clone()));
    }

    /// Keeps `dependency` alive until this frame has completed on the GPU.
    pub fn retain(&mut self, dependency: impl Any + Send) {
        self.retained.push(Box::new(dependency));
    }

    /// Submits the frame and presents it.
    pub fn finish(mut self) -> Result<FrameStatus> {
        let pacer = &mut *self.pacer;
        let device = pacer.device.clone();
        let slot = &mut pacer.slots[self.slot];

        let final_layout = pacer.target.final_layout();
        let barrier = self.target_state.transition(Access::ALL_COMMANDS, true);
        let mut batch = BarrierBatch::new();
        batch.image_barrier(
            self.image.image,
            vk::ImageAspectFlags::COLOR,
            barrier.src,
            barrier.dst,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
            0..1,
        );
        batch.emit(&device, &slot.command_buffer);
        slot.pool.finish(&mut slot.command_buffer)?;

        let mut waits = std::mem::take(&mut self.waits);
        if let Some(acquired) = &self.image.acquire_semaphore {
            waits.push(vk::SemaphoreSubmitInfo {
                semaphore: acquired.raw(),
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                ..Default::default()
            });
        }
        if let Some(ready) = &self.image.ready {
            waits.push(ready.wait_info(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT));
        }
        let rendered = SyncPoint::new(slot.semaphore.clone(), self.index + 1);
        let mut signals = vec![rendered.signal_info(vk::PipelineStageFlags2::ALL_COMMANDS)];
        if let Some(present) = &self.image.present_semaphore {
            signals.push(vk::SemaphoreSubmitInfo {
                semaphore: present.raw(),
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            });
        }

        {
            let queue = device.lock_queue(device.families().graphics, 0);
            device.queue_submit(*queue, &[slot.command_buffer.raw()], &waits, &signals)?;
        }
        slot.command_buffer.mark_pending();
        slot.target_value = rendered.value;

        for (data, access) in self.sampled.drain(..) {
            data.retire(access, &rendered);
            slot.dependencies.push(Box::new(data));
        }
        slot.dependencies.append(&mut self.retained);
        pacer.frame_index += 1;
        self.finished = true;

        match pacer.target.present(&self.image, &rendered) {
            Ok(()) => Ok(FrameStatus::Presented),
            Err(Error::SurfaceOutOfDate) => {
                tracing::warn!(frame = self.index, "Present target out of date, frame dropped");
                pacer.target.recreate()?;
                Ok(FrameStatus::Dropped)
            }
            Err(err) => Err(err),
        }
    }
}

impl<T: PresentTarget> Drop for Frame<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(frame = self.index, "Frame abandoned without being submitted");
        }
    }
}
