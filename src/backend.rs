//! The device seam.
//!
//! [`DeviceBackend`] is the narrow set of device entry points the synchronization engine needs.
//! Everything above this trait (semaphores, queue locking, transient pools, plane ownership,
//! frame pacing) is written once against it.
//!
//! Two implementations ship with the crate:
//!
//! - [`VulkanBackend`](crate::vulkan::VulkanBackend) calls straight into `ash`.
//! - [`HeadlessBackend`](crate::headless::HeadlessBackend) is an in-process software device that
//!   executes submissions in queue order, honors semaphore waits, and records every barrier it
//!   is asked to execute.
//!
//! Handles are raw `ash::vk` handles. Callers are responsible for the external synchronization
//! rules of the underlying API; in particular [`queue_submit`](DeviceBackend::queue_submit) must
//! only be called while holding the queue's lock from
//! [`QueueMutexMap`](crate::queue::QueueMutexMap).

use ash::{prelude::VkResult, vk};

/// Device operations used by the engine.
pub trait DeviceBackend: Send + Sync {
    // -- Semaphores --

    /// Creates a semaphore. `initial_value` is ignored for binary semaphores.
    fn create_semaphore(&self, ty: vk::SemaphoreType, initial_value: u64)
    -> VkResult<vk::Semaphore>;

    /// Destroys a semaphore. No pending submission may reference it.
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Reads the current counter of a timeline semaphore without blocking.
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;

    /// Blocks until all (or, with `wait_any`, at least one) of the timeline semaphores reach
    /// their values. Returns `Err(vk::Result::TIMEOUT)` once `timeout` nanoseconds elapse.
    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout: u64,
    ) -> VkResult<()>;

    /// Signals a timeline semaphore from the host.
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;

    // -- Command pools and buffers --

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;

    /// Returns every command buffer allocated from the pool to the initial state.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    /// Begins recording with `ONE_TIME_SUBMIT` usage.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    // -- Commands --

    /// Records one `vkCmdPipelineBarrier2` carrying the given image barriers.
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // -- Queues --

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue;

    /// Submits command buffers with synchronization2 wait and signal lists.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[vk::SemaphoreSubmitInfo<'_>],
        signals: &[vk::SemaphoreSubmitInfo<'_>],
    ) -> VkResult<()>;

    /// Blocks until every queue on the device is idle.
    fn wait_idle(&self) -> VkResult<()>;
}
