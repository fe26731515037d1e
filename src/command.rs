//! # Command Recording
//!
//! Thin, state-checked wrappers over command pools and command buffers.
//!
//! ## Key Concepts
//! - Submission: A call to [vkQueueSubmit2](https://vkdoc.net/man/vkQueueSubmit2). Requires
//!   exclusive ownership over the queue, see [`QueueMutexMap`](crate::queue::QueueMutexMap).
//! - Queue: Submissions made on the same queue begin in-order but may finish out-of-order. Across
//!   queues there is no ordering at all except what semaphores establish.
//! - Pipeline Barrier: A call to [vkCmdPipelineBarrier2](https://vkdoc.net/man/vkCmdPipelineBarrier2).
//!   Orders pipeline stages within a queue, transitions image layouts, and releases or acquires
//!   queue family ownership.
//!
//! ## Key Components
//!
//! - [`CommandPool`]: One `VkCommandPool` for one queue family.
//! - [`CommandBuffer`]: A one-shot primary command buffer with an explicit lifecycle.
//! - [`BarrierBatch`]: Accumulates image barriers and emits them with a single
//!   `vkCmdPipelineBarrier2`.

use std::ops::Range;

use ash::vk;

use crate::{Device, HasDevice, Result, tracking::Access};

/// Represents the current state of a command buffer in its lifecycle.
///
/// ```text
/// Initial -> Recording -> Executable -> Pending -> Invalid
///    |                                              |
///    +----------------<<<---------------- (reset) --+
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum CommandBufferState {
    /// Newly allocated or reset, ready to begin.
    Initial,
    /// Currently being recorded with commands.
    Recording,
    /// Recording finished, ready for submission to a queue.
    Executable,
    /// Submitted to a queue and possibly executing on the GPU.
    Pending,
    /// Execution completed, can be reset or freed.
    Invalid,
}

/// A primary command buffer allocated from a [`CommandPool`].
///
/// Command buffers are not destroyed on drop; they are returned to their pool with
/// [`CommandPool::free`] or reclaimed in bulk with [`CommandPool::reset`]. Submitted buffers
/// must only be freed after the GPU has finished with them.
#[derive(Debug)]
pub struct CommandBuffer {
    pub(crate) handle: vk::CommandBuffer,
    pub(crate) pool: vk::CommandPool,
    pub(crate) family_index: u32,
    pub(crate) state: CommandBufferState,
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
    pub fn raw(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Marks a submitted buffer as pending. Called by whoever performed the submission.
    pub(crate) fn mark_pending(&mut self) {
        assert_eq!(
            self.state,
            CommandBufferState::Executable,
            "The command buffer must finish recording first!"
        );
        self.state = CommandBufferState::Pending;
    }

    /// Marks a pending buffer as completed once its signal has been observed.
    pub(crate) fn mark_completed(&mut self) {
        if self.state == CommandBufferState::Pending {
            self.state = CommandBufferState::Invalid;
        }
    }
}

/// A pool for allocating command buffers for a single queue family.
///
/// Created with the `TRANSIENT` flag: buffers are short-lived and recorded once.
///
/// # Thread Safety
///
/// Command pools are externally synchronized. `CommandPool` methods take `&mut self`; share a
/// pool across threads only behind a lock.
pub struct CommandPool {
    device: Device,
    handle: vk::CommandPool,
    family_index: u32,
}

impl HasDevice for CommandPool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.handle);
    }
}

impl CommandPool {
    /// Creates a new transient command pool for a specific queue family.
    pub fn new(device: Device, family_index: u32) -> Result<Self> {
        let handle = device.create_command_pool(family_index)?;
        tracing::debug!(queue_family = family_index, "Created command pool");
        Ok(Self {
            device,
            handle,
            family_index,
        })
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.handle
    }

    /// Allocate a new command buffer from the pool.
    pub fn alloc(&mut self) -> Result<CommandBuffer> {
        let handle = self.device.allocate_command_buffer(self.handle)?;
        Ok(CommandBuffer {
            handle,
            pool: self.handle,
            family_index: self.family_index,
            state: CommandBufferState::Initial,
        })
    }

    /// Begin recording a one-time-submit command buffer.
    pub fn begin(&mut self, cb: &mut CommandBuffer) -> Result<()> {
        assert_eq!(
            cb.state,
            CommandBufferState::Initial,
            "This command buffer has already been recorded!"
        );
        assert_eq!(cb.pool, self.handle, "Command buffer beginning on the wrong pool!");
        self.device.begin_command_buffer(cb.handle)?;
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    /// End recording on a command buffer. Must be called before submitting it.
    pub fn finish(&mut self, cb: &mut CommandBuffer) -> Result<()> {
        assert_eq!(cb.pool, self.handle, "Command buffer finished on the wrong pool!");
        assert_eq!(cb.state, CommandBufferState::Recording);
        self.device.end_command_buffer(cb.handle)?;
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Returns a command buffer to the pool, consuming it.
    pub fn free(&mut self, cb: CommandBuffer) {
        assert_eq!(cb.pool, self.handle, "Command buffer returned to the wrong pool!");
        assert_ne!(
            cb.state,
            CommandBufferState::Pending,
            "Command buffer is still being executed!"
        );
        self.device.free_command_buffer(self.handle, cb.handle);
    }

    /// Resets every buffer allocated from this pool back to [`CommandBufferState::Initial`].
    ///
    /// The caller guarantees that none of them is still executing.
    pub fn reset(&mut self, buffers: &mut [&mut CommandBuffer]) -> Result<()> {
        for cb in buffers.iter() {
            assert_eq!(cb.pool, self.handle, "Command buffer resetting on the wrong pool!");
            assert_ne!(
                cb.state,
                CommandBufferState::Pending,
                "Command buffer is still being executed!"
            );
        }
        self.device.reset_command_pool(self.handle)?;
        for cb in buffers.iter_mut() {
            cb.state = CommandBufferState::Initial;
        }
        Ok(())
    }
}

/// Accumulated image barriers, emitted as one pipeline barrier command.
#[derive(Default)]
pub struct BarrierBatch {
    image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layout transition and/or queue family ownership change.
    ///
    /// Pass [`vk::QUEUE_FAMILY_IGNORED`] for both families when ownership does not change.
    #[allow(clippy::too_many_arguments)]
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        before: Access,
        after: Access,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_queue_family: u32,
        dst_queue_family: u32,
        array_layer_range: Range<u32>,
    ) {
        self.image_barriers.push(vk::ImageMemoryBarrier2 {
            src_stage_mask: before.stage,
            src_access_mask: before.access,
            dst_stage_mask: after.stage,
            dst_access_mask: after.access,
            old_layout,
            new_layout,
            src_queue_family_index: src_queue_family,
            dst_queue_family_index: dst_queue_family,
            image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: array_layer_range.start,
                layer_count: array_layer_range.end - array_layer_range.start,
            },
            ..Default::default()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.image_barriers.len()
    }

    /// Records all pending barriers into `cb` with a single command and clears the batch.
    pub fn emit(&mut self, device: &Device, cb: &CommandBuffer) {
        if self.image_barriers.is_empty() {
            return;
        }
        assert_eq!(
            cb.state,
            CommandBufferState::Recording,
            "Barriers can only be emitted into a recording command buffer"
        );
        device.cmd_pipeline_barrier(cb.handle, &self.image_barriers);
        self.image_barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::QueueFamilies, headless::HeadlessBackend};
    use std::sync::Arc;

    fn device() -> (Device, Arc<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        (
            Device::new(backend.clone(), QueueFamilies::single(0)),
            backend,
        )
    }

    #[test]
    fn lifecycle_transitions() {
        let (device, _backend) = device();
        let mut pool = CommandPool::new(device, 0).unwrap();
        let mut cb = pool.alloc().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Initial);
        pool.begin(&mut cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recording);
        pool.finish(&mut cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);
        cb.mark_pending();
        cb.mark_completed();
        assert_eq!(cb.state(), CommandBufferState::Invalid);
        pool.reset(&mut [&mut cb]).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Initial);
        pool.free(cb);
    }

    #[test]
    #[should_panic(expected = "still being executed")]
    fn freeing_pending_buffer_panics() {
        let (device, _backend) = device();
        let mut pool = CommandPool::new(device, 0).unwrap();
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        pool.finish(&mut cb).unwrap();
        cb.mark_pending();
        pool.free(cb);
    }

    #[test]
    fn batch_emits_one_command() {
        let (device, backend) = device();
        let mut pool = CommandPool::new(device.clone(), 0).unwrap();
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        let mut batch = BarrierBatch::new();
        for layer in 0..2 {
            batch.image_barrier(
                vk::Image::null(),
                vk::ImageAspectFlags::COLOR,
                Access::COPY_WRITE,
                Access::FRAGMENT_SAMPLED_READ,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
                layer..layer + 1,
            );
        }
        assert_eq!(batch.len(), 2);
        batch.emit(&device, &cb);
        assert!(batch.is_empty());
        let recorded = backend.recorded_barriers(cb.raw());
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].subresource_range.base_array_layer, 1);
        assert_eq!(backend.barrier_command_count(cb.raw()), 1);
        pool.finish(&mut cb).unwrap();
        pool.free(cb);
    }
}
