//! An in-process software device.
//!
//! [`HeadlessBackend`] implements [`DeviceBackend`] without a GPU. It is what the test-suite runs
//! on, and downstream applications can use it to test their own frame loops deterministically.
//!
//! # Execution model
//!
//! - Every `(family, index)` queue has a FIFO of pending submissions. A submission executes once
//!   every semaphore it waits on has reached its value, and never before an earlier submission
//!   on the same queue.
//! - Executing a submission raises its signal semaphores. Nothing else happens on "the GPU":
//!   command buffers are not interpreted, only recorded.
//! - With [`set_hold(true)`](HeadlessBackend::set_hold) submissions stay pending until the hold
//!   is lifted, which is how tests observe the window between submission and completion.
//!
//! Every submission, host signal and successful host wait is appended to an [event log](Event).
//!
//! [`HeadlessSurface`] is the matching [`PresentTarget`].

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{Duration, Instant},
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use glam::UVec2;
use parking_lot::{Condvar, Mutex};

use crate::{
    Result,
    backend::DeviceBackend,
    present::{AcquiredImage, PresentTarget},
    sync::SyncPoint,
};

/// A pipeline barrier as recorded by [`HeadlessBackend`].
#[derive(Debug, Clone, Copy)]
pub struct RecordedBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl From<&vk::ImageMemoryBarrier2<'_>> for RecordedBarrier {
    fn from(barrier: &vk::ImageMemoryBarrier2<'_>) -> Self {
        Self {
            src_stage_mask: barrier.src_stage_mask,
            src_access_mask: barrier.src_access_mask,
            dst_stage_mask: barrier.dst_stage_mask,
            dst_access_mask: barrier.dst_access_mask,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_queue_family_index: barrier.src_queue_family_index,
            dst_queue_family_index: barrier.dst_queue_family_index,
            image: barrier.image,
            subresource_range: barrier.subresource_range,
        }
    }
}

impl RecordedBarrier {
    /// `true` if this barrier releases ownership to another queue family.
    pub fn is_release(&self, on_family: u32) -> bool {
        self.src_queue_family_index != self.dst_queue_family_index
            && self.src_queue_family_index == on_family
    }

    /// `true` if this barrier acquires ownership from another queue family.
    pub fn is_acquire(&self, on_family: u32) -> bool {
        self.src_queue_family_index != self.dst_queue_family_index
            && self.dst_queue_family_index == on_family
    }
}

/// One `queue_submit` call.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub family: u32,
    pub queue_index: u32,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Barriers of all command buffers, in recording order.
    pub barriers: Vec<RecordedBarrier>,
    /// Number of buffer-to-image copies recorded.
    pub copies: usize,
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub signals: Vec<(vk::Semaphore, u64)>,
}

impl SubmitRecord {
    pub fn waits_on(&self, semaphore: vk::Semaphore, value: u64) -> bool {
        self.waits
            .iter()
            .any(|&(s, v)| s == semaphore && v >= value)
    }
    pub fn signals(&self, semaphore: vk::Semaphore) -> Option<u64> {
        self.signals
            .iter()
            .find(|&&(s, _)| s == semaphore)
            .map(|&(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Submitted(SubmitRecord),
    /// A submission finished executing on its queue.
    Executed {
        family: u32,
        queue_index: u32,
        signals: Vec<(vk::Semaphore, u64)>,
    },
    /// A host wait returned successfully.
    HostWait {
        semaphores: Vec<(vk::Semaphore, u64)>,
        wait_any: bool,
    },
    HostSignal {
        semaphore: vk::Semaphore,
        value: u64,
    },
}

#[derive(Debug)]
enum SemaphoreState {
    Timeline(u64),
    Binary(bool),
}

#[derive(Default)]
struct CommandBufferRecord {
    pool: u64,
    recording: bool,
    barriers: Vec<RecordedBarrier>,
    barrier_commands: usize,
    copies: usize,
}

struct PendingSubmit {
    command_buffers: Vec<vk::CommandBuffer>,
    waits: Vec<(vk::Semaphore, u64)>,
    signals: Vec<(vk::Semaphore, u64)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    pools: HashMap<u64, u32>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferRecord>,
    queues: BTreeMap<(u32, u32), VecDeque<PendingSubmit>>,
    hold: bool,
    events: Vec<Event>,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn is_ready(&self, semaphore: vk::Semaphore, value: u64) -> bool {
        match self.semaphores.get(&semaphore) {
            Some(SemaphoreState::Timeline(current)) => *current >= value,
            Some(SemaphoreState::Binary(signaled)) => *signaled,
            None => false,
        }
    }

    fn raise(&mut self, semaphore: vk::Semaphore, value: u64) {
        match self.semaphores.get_mut(&semaphore) {
            Some(SemaphoreState::Timeline(current)) => *current = (*current).max(value),
            Some(SemaphoreState::Binary(signaled)) => *signaled = true,
            None => {
                tracing::error!(?semaphore, "Signaling a semaphore that no longer exists");
            }
        }
    }

    /// Executes every submission whose waits are satisfied, in queue order, until no queue
    /// makes progress. Returns the number of submissions executed.
    fn run_ready(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let mut progress = false;
            let keys: Vec<(u32, u32)> = self.queues.keys().copied().collect();
            for key in keys {
                loop {
                    let ready = match self.queues.get(&key).and_then(|q| q.front()) {
                        Some(front) => front.waits.iter().all(|&(s, v)| self.is_ready(s, v)),
                        None => false,
                    };
                    if !ready {
                        break;
                    }
                    let Some(submit) = self.queues.get_mut(&key).and_then(|q| q.pop_front())
                    else {
                        break;
                    };
                    for &(semaphore, _) in submit.waits.iter() {
                        if let Some(SemaphoreState::Binary(signaled)) =
                            self.semaphores.get_mut(&semaphore)
                        {
                            *signaled = false;
                        }
                    }
                    for &(semaphore, value) in submit.signals.iter() {
                        self.raise(semaphore, value);
                    }
                    self.events.push(Event::Executed {
                        family: key.0,
                        queue_index: key.1,
                        signals: submit.signals,
                    });
                    executed += 1;
                    progress = true;
                }
            }
            if !progress {
                return executed;
            }
        }
    }

    fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn is_referenced(&self, semaphore: vk::Semaphore) -> bool {
        self.queues.values().flatten().any(|submit| {
            submit.waits.iter().any(|&(s, _)| s == semaphore)
                || submit.signals.iter().any(|&(s, _)| s == semaphore)
        })
    }
}

const QUEUE_TAG: u64 = 0x5100_0000_0000;

fn queue_handle(family: u32, index: u32) -> vk::Queue {
    vk::Queue::from_raw(QUEUE_TAG | ((family as u64) << 16) | index as u64)
}

fn queue_key(queue: vk::Queue) -> Option<(u32, u32)> {
    let raw = queue.as_raw();
    if raw & !0xFFFF_FFFF != QUEUE_TAG {
        return None;
    }
    Some((((raw >> 16) & 0xFFFF) as u32, (raw & 0xFFFF) as u32))
}

/// A software [`DeviceBackend`].
#[derive(Default)]
pub struct HeadlessBackend {
    state: Mutex<State>,
    progress: Condvar,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While held, submissions are queued but not executed.
    ///
    /// Lifting the hold executes everything that became ready.
    pub fn set_hold(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold = hold;
        if !hold && state.run_ready() > 0 {
            self.progress.notify_all();
        }
    }

    /// Executes every ready submission even while held. Returns how many ran.
    pub fn execute_pending(&self) -> usize {
        let mut state = self.state.lock();
        let executed = state.run_ready();
        if executed > 0 {
            self.progress.notify_all();
        }
        executed
    }

    /// Number of submitted but not yet executed submissions across all queues.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// All submissions in submission order.
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Submitted(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn semaphore_exists(&self, semaphore: vk::Semaphore) -> bool {
        self.state.lock().semaphores.contains_key(&semaphore)
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn command_pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Barriers recorded into `command_buffer` since it last began recording.
    pub fn recorded_barriers(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedBarrier> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|record| record.barriers.clone())
            .unwrap_or_default()
    }

    /// Number of `cmd_pipeline_barrier` calls recorded into `command_buffer`.
    pub fn barrier_command_count(&self, command_buffer: vk::CommandBuffer) -> usize {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map_or(0, |record| record.barrier_commands)
    }
}

impl DeviceBackend for HeadlessBackend {
    fn create_semaphore(
        &self,
        ty: vk::SemaphoreType,
        initial_value: u64,
    ) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let handle = vk::Semaphore::from_raw(state.next_handle());
        let semaphore = if ty == vk::SemaphoreType::BINARY {
            SemaphoreState::Binary(false)
        } else {
            SemaphoreState::Timeline(initial_value)
        };
        state.semaphores.insert(handle, semaphore);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.is_referenced(semaphore) {
            tracing::error!(
                ?semaphore,
                "Semaphore destroyed while a pending submission still references it"
            );
        }
        state.semaphores.remove(&semaphore);
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        match self.state.lock().semaphores.get(&semaphore) {
            Some(SemaphoreState::Timeline(value)) => Ok(*value),
            Some(SemaphoreState::Binary(_)) => Err(vk::Result::ERROR_FEATURE_NOT_PRESENT),
            None => Err(vk::Result::ERROR_DEVICE_LOST),
        }
    }

    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout: u64,
    ) -> VkResult<()> {
        assert_eq!(semaphores.len(), values.len());
        let deadline = (timeout != u64::MAX)
            .then(|| Instant::now().checked_add(Duration::from_nanos(timeout)))
            .flatten();
        let mut state = self.state.lock();
        loop {
            let mut reached = semaphores
                .iter()
                .zip(values.iter())
                .map(|(&s, &v)| state.is_ready(s, v));
            let done = if wait_any {
                reached.any(|x| x)
            } else {
                reached.all(|x| x)
            };
            if done {
                state.events.push(Event::HostWait {
                    semaphores: semaphores.iter().copied().zip(values.iter().copied()).collect(),
                    wait_any,
                });
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        let reached = semaphores
                            .iter()
                            .zip(values.iter())
                            .filter(|&(&s, &v)| state.is_ready(s, v))
                            .count();
                        let done = if wait_any {
                            reached > 0
                        } else {
                            reached == semaphores.len()
                        };
                        if !done {
                            return Err(vk::Result::TIMEOUT);
                        }
                    }
                }
                // Infinite, or far enough out to overflow `Instant`.
                None => self.progress.wait(&mut state),
            }
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.raise(semaphore, value);
        state.events.push(Event::HostSignal { semaphore, value });
        if !state.hold {
            state.run_ready();
        }
        self.progress.notify_all();
        Ok(())
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.next_handle();
        state.pools.insert(raw, queue_family_index);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state.lock();
        for record in state.command_buffers.values_mut() {
            if record.pool == pool.as_raw() {
                record.recording = false;
                record.barriers.clear();
                record.barrier_commands = 0;
                record.copies = 0;
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        state
            .command_buffers
            .retain(|_, record| record.pool != pool.as_raw());
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let handle = vk::CommandBuffer::from_raw(state.next_handle());
        state.command_buffers.insert(
            handle,
            CommandBufferRecord {
                pool: pool.as_raw(),
                ..Default::default()
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&command_buffer);
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let record = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        record.recording = true;
        record.barriers.clear();
        record.barrier_commands = 0;
        record.copies = 0;
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let record = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        record.recording = false;
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.command_buffers.get_mut(&command_buffer) {
            debug_assert!(record.recording);
            record
                .barriers
                .extend(image_barriers.iter().map(RecordedBarrier::from));
            record.barrier_commands += 1;
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        _buffer: vk::Buffer,
        _image: vk::Image,
        _layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.command_buffers.get_mut(&command_buffer) {
            debug_assert!(record.recording);
            record.copies += regions.len();
        }
    }

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        queue_handle(queue_family_index, queue_index)
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[vk::SemaphoreSubmitInfo<'_>],
        signals: &[vk::SemaphoreSubmitInfo<'_>],
    ) -> VkResult<()> {
        let (family, queue_index) = queue_key(queue).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let mut state = self.state.lock();
        let mut barriers = Vec::new();
        let mut copies = 0;
        for cb in command_buffers {
            let record = state
                .command_buffers
                .get(cb)
                .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
            assert!(!record.recording, "Submitting a command buffer that is still recording");
            barriers.extend_from_slice(&record.barriers);
            copies += record.copies;
        }
        let waits: Vec<_> = waits.iter().map(|w| (w.semaphore, w.value)).collect();
        let signals: Vec<_> = signals.iter().map(|s| (s.semaphore, s.value)).collect();
        state.events.push(Event::Submitted(SubmitRecord {
            family,
            queue_index,
            command_buffers: command_buffers.to_vec(),
            barriers,
            copies,
            waits: waits.clone(),
            signals: signals.clone(),
        }));
        state
            .queues
            .entry((family, queue_index))
            .or_default()
            .push_back(PendingSubmit {
                command_buffers: command_buffers.to_vec(),
                waits,
                signals,
            });
        if !state.hold && state.run_ready() > 0 {
            self.progress.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        // Idle means everything that can run has run, hold or not.
        loop {
            if state.run_ready() > 0 {
                self.progress.notify_all();
            }
            if state.pending() == 0 {
                return Ok(());
            }
            let blocked: Vec<vk::CommandBuffer> = state
                .queues
                .values()
                .flatten()
                .flat_map(|submit| submit.command_buffers.iter().copied())
                .collect();
            tracing::debug!(?blocked, "Waiting for idle with blocked submissions");
            self.progress.wait(&mut state);
        }
    }
}

/// A [`PresentTarget`] with no display behind it.
///
/// Images are fabricated handles. Failures can be injected with
/// [`fail_acquires`](Self::fail_acquires) and [`fail_presents`](Self::fail_presents).
pub struct HeadlessSurface {
    images: Vec<vk::Image>,
    extent: UVec2,
    next: u32,
    failing_acquires: u32,
    failing_presents: u32,
    recreations: u32,
    presented: Vec<(u32, u64)>,
    resize_to: Option<UVec2>,
}

impl HeadlessSurface {
    pub fn new(image_count: u32, extent: UVec2) -> Self {
        Self {
            images: (0..image_count)
                .map(|i| vk::Image::from_raw(0x1_0000 + i as u64))
                .collect(),
            extent,
            next: 0,
            failing_acquires: 0,
            failing_presents: 0,
            recreations: 0,
            presented: Vec::new(),
            resize_to: None,
        }
    }

    /// The next `count` acquires report an out-of-date surface.
    pub fn fail_acquires(&mut self, count: u32) {
        self.failing_acquires = count;
    }

    /// The next `count` presents report an out-of-date surface.
    pub fn fail_presents(&mut self, count: u32) {
        self.failing_presents = count;
    }

    /// The next recreation picks up this extent.
    pub fn resize(&mut self, extent: UVec2) {
        self.resize_to = Some(extent);
    }

    pub fn recreations(&self) -> u32 {
        self.recreations
    }

    /// `(image index, completion value)` of every successful present.
    pub fn presented(&self) -> &[(u32, u64)] {
        &self.presented
    }
}

impl PresentTarget for HeadlessSurface {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        if self.failing_acquires > 0 {
            self.failing_acquires -= 1;
            return Err(crate::Error::SurfaceOutOfDate);
        }
        let index = self.next;
        self.next = (self.next + 1) % self.images.len() as u32;
        Ok(AcquiredImage {
            index,
            image: self.images[index as usize],
            view: vk::ImageView::null(),
            extent: self.extent,
            format: self.format(),
            acquire_semaphore: None,
            present_semaphore: None,
            ready: None,
        })
    }

    fn present(&mut self, image: &AcquiredImage, rendered: &SyncPoint) -> Result<()> {
        if self.failing_presents > 0 {
            self.failing_presents -= 1;
            return Err(crate::Error::SurfaceOutOfDate);
        }
        self.presented.push((image.index, rendered.value));
        Ok(())
    }

    fn recreate(&mut self) -> Result<()> {
        if let Some(extent) = self.resize_to.take() {
            self.extent = extent;
        }
        self.next = 0;
        self.recreations += 1;
        Ok(())
    }

    fn extent(&self) -> UVec2 {
        self.extent
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_UNORM
    }

    fn final_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::PRESENT_SRC_KHR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_info(semaphore: vk::Semaphore, value: u64) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo {
            semaphore,
            value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        }
    }

    #[test]
    fn submissions_wait_for_their_semaphores() {
        let backend = HeadlessBackend::new();
        let gate = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let done = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let queue = backend.get_queue(1, 0);
        backend
            .queue_submit(queue, &[], &[submit_info(gate, 1)], &[submit_info(done, 7)])
            .unwrap();
        assert_eq!(backend.pending_submissions(), 1);
        assert_eq!(backend.semaphore_counter_value(done).unwrap(), 0);
        backend.signal_semaphore(gate, 1).unwrap();
        assert_eq!(backend.pending_submissions(), 0);
        assert_eq!(backend.semaphore_counter_value(done).unwrap(), 7);
    }

    #[test]
    fn queue_order_is_preserved() {
        let backend = HeadlessBackend::new();
        let gate = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let done = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let queue = backend.get_queue(0, 0);
        backend
            .queue_submit(queue, &[], &[submit_info(gate, 1)], &[])
            .unwrap();
        // Nothing to wait on, but it is queued behind the blocked submission.
        backend
            .queue_submit(queue, &[], &[], &[submit_info(done, 1)])
            .unwrap();
        assert_eq!(backend.semaphore_counter_value(done).unwrap(), 0);
        backend.signal_semaphore(gate, 1).unwrap();
        assert_eq!(backend.semaphore_counter_value(done).unwrap(), 1);
    }

    #[test]
    fn hold_defers_execution() {
        let backend = HeadlessBackend::new();
        let done = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        backend.set_hold(true);
        backend
            .queue_submit(backend.get_queue(0, 0), &[], &[], &[submit_info(done, 1)])
            .unwrap();
        assert_eq!(
            backend.wait_semaphores(&[done], &[1], false, 1_000_000),
            Err(vk::Result::TIMEOUT)
        );
        backend.set_hold(false);
        backend.wait_semaphores(&[done], &[1], false, 0).unwrap();
    }

    #[test]
    fn wait_any_returns_on_first() {
        let backend = HeadlessBackend::new();
        let a = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let b = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 5)
            .unwrap();
        backend.wait_semaphores(&[a, b], &[1, 5], true, 0).unwrap();
        assert_eq!(
            backend.wait_semaphores(&[a, b], &[1, 5], false, 0),
            Err(vk::Result::TIMEOUT)
        );
    }

    #[test]
    fn binary_semaphores_are_consumed() {
        let backend = HeadlessBackend::new();
        let binary = backend.create_semaphore(vk::SemaphoreType::BINARY, 0).unwrap();
        let done = backend
            .create_semaphore(vk::SemaphoreType::TIMELINE, 0)
            .unwrap();
        let queue = backend.get_queue(0, 0);
        backend
            .queue_submit(queue, &[], &[], &[submit_info(binary, 0)])
            .unwrap();
        backend
            .queue_submit(queue, &[], &[submit_info(binary, 0)], &[submit_info(done, 1)])
            .unwrap();
        backend
            .queue_submit(queue, &[], &[submit_info(binary, 0)], &[submit_info(done, 2)])
            .unwrap();
        assert_eq!(backend.semaphore_counter_value(done).unwrap(), 1);
        assert_eq!(backend.pending_submissions(), 1);
    }

    #[test]
    fn barriers_are_snapshotted_at_submit() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool(0).unwrap();
        let cb = backend.allocate_command_buffer(pool).unwrap();
        backend.begin_command_buffer(cb).unwrap();
        backend.cmd_pipeline_barrier(
            cb,
            &[vk::ImageMemoryBarrier2 {
                new_layout: vk::ImageLayout::GENERAL,
                ..Default::default()
            }],
        );
        backend.end_command_buffer(cb).unwrap();
        backend
            .queue_submit(backend.get_queue(0, 0), &[cb], &[], &[])
            .unwrap();
        backend.reset_command_pool(pool).unwrap();
        assert!(backend.recorded_barriers(cb).is_empty());
        let submissions = backend.submissions();
        assert_eq!(submissions[0].barriers[0].new_layout, vk::ImageLayout::GENERAL);
        backend.destroy_command_pool(pool);
        assert_eq!(backend.live_command_buffers(), 0);
    }

    #[test]
    fn surface_injects_failures() {
        let mut surface = HeadlessSurface::new(2, UVec2::new(64, 32));
        surface.fail_acquires(1);
        assert!(matches!(
            surface.acquire(),
            Err(crate::Error::SurfaceOutOfDate)
        ));
        surface.resize(UVec2::new(128, 64));
        surface.recreate().unwrap();
        let image = surface.acquire().unwrap();
        assert_eq!(image.index, 0);
        assert_eq!(image.extent, UVec2::new(128, 64));
        assert_eq!(surface.acquire().unwrap().index, 1);
        assert_eq!(surface.acquire().unwrap().index, 0);
    }
}
