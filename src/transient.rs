//! One-shot submissions on any queue family.
//!
//! [`TransientPools`] is the fire-and-forget path used for ownership transfers and uploads:
//!
//! 1. [`begin`](TransientPools::begin) hands out a command buffer that is already recording,
//!    allocated from a pool created lazily for the requested family.
//! 2. [`end`](TransientPools::end) submits it under the queue's lock, signaling a fresh
//!    semaphore, and keeps the command buffer and an arbitrary payload alive in a pending list.
//! 3. [`garbage_collect`](TransientPools::garbage_collect) polls the pending list and drops
//!    whatever the GPU has finished with.
//!
//! Nothing is reclaimed automatically. Call `garbage_collect` once per frame.
//!
//! Every operation gets its own semaphore, so unrelated transfers on the same family never wait
//! on each other.

use std::{any::Any, collections::BTreeMap};

use ash::vk;
use parking_lot::Mutex;

use crate::{
    Device, HasDevice, Result,
    command::{CommandBuffer, CommandPool},
    sync::{SharedSemaphore, SyncPoint},
};

/// Deferred GPU work: a submitted command buffer and everything it needs until it completes.
pub struct TransferOperation {
    command_buffer: Option<CommandBuffer>,
    pool: vk::CommandPool,
    signal: SyncPoint,
    free_on_finish: Option<Box<dyn Any + Send>>,
    device: Device,
}

impl TransferOperation {
    pub fn signal(&self) -> &SyncPoint {
        &self.signal
    }

    /// Returns the finished command buffer to its pool. The caller holds the pool lock.
    fn free_command_buffer(&mut self, pools: &mut BTreeMap<u32, CommandPool>) {
        let Some(mut cb) = self.command_buffer.take() else {
            return;
        };
        cb.mark_completed();
        match pools.get_mut(&cb.family_index()) {
            Some(pool) => pool.free(cb),
            None => self.device.free_command_buffer(self.pool, cb.raw()),
        }
    }
}

impl Drop for TransferOperation {
    fn drop(&mut self) {
        // Teardown only: no other thread can reach the pool.
        if let Some(mut cb) = self.command_buffer.take() {
            cb.mark_completed();
            self.device.free_command_buffer(self.pool, cb.raw());
        }
        self.free_on_finish.take();
    }
}

/// Lazily created per-family command pools plus the list of in-flight operations.
pub struct TransientPools {
    device: Device,
    pools: Mutex<BTreeMap<u32, CommandPool>>,
    pending: Mutex<Vec<TransferOperation>>,
}

impl HasDevice for TransientPools {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl TransientPools {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            pools: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Returns a command buffer for `queue_family` in the recording state.
    pub fn begin(&self, queue_family: u32) -> Result<CommandBuffer> {
        let mut pools = self.pools.lock();
        let pool = match pools.entry(queue_family) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(CommandPool::new(self.device.clone(), queue_family)?)
            }
        };
        let mut cb = pool.alloc()?;
        pool.begin(&mut cb)?;
        Ok(cb)
    }

    /// Ends recording and submits `cb` on queue 0 of its family.
    ///
    /// The submission waits on `waits` and signals a new semaphore to 1. The command buffer and
    /// `free_on_finish` stay alive until a [`garbage_collect`](Self::garbage_collect) observes
    /// that point.
    pub fn end(
        &self,
        mut cb: CommandBuffer,
        free_on_finish: Option<Box<dyn Any + Send>>,
        waits: &[vk::SemaphoreSubmitInfo<'_>],
    ) -> Result<SyncPoint> {
        let family = cb.family_index();
        let pool_handle = {
            let mut pools = self.pools.lock();
            let Some(pool) = pools.get_mut(&family) else {
                panic!("Command buffer was not allocated by these pools");
            };
            pool.finish(&mut cb)?;
            pool.raw()
        };

        let semaphore = SharedSemaphore::new(self.device.clone(), 0)?;
        let signal = SyncPoint::new(semaphore, 1);
        {
            let queue = self.device.lock_queue(family, 0);
            self.device.queue_submit(
                *queue,
                &[cb.raw()],
                waits,
                &[signal.signal_info(vk::PipelineStageFlags2::ALL_COMMANDS)],
            )?;
        }
        cb.mark_pending();

        self.pending.lock().push(TransferOperation {
            command_buffer: Some(cb),
            pool: pool_handle,
            signal: signal.clone(),
            free_on_finish,
            device: self.device.clone(),
        });
        Ok(signal)
    }

    /// Reclaims every pending operation whose semaphore has been reached.
    ///
    /// Waits up to `timeout` nanoseconds for at least one of them. A timeout is not an error
    /// here: nothing is reclaimed and `Ok(0)` is returned. Returns the number of operations
    /// reclaimed.
    pub fn garbage_collect(&self, timeout: u64) -> Result<usize> {
        let (semaphores, values): (Vec<vk::Semaphore>, Vec<u64>) = {
            let pending = self.pending.lock();
            if pending.is_empty() {
                return Ok(0);
            }
            pending
                .iter()
                .map(|op| (op.signal.semaphore.raw(), op.signal.value))
                .unzip()
        };

        match self
            .device
            .wait_semaphores(&semaphores, &values, true, timeout)
        {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let mut finished = {
            let mut pending = self.pending.lock();
            let mut finished = Vec::new();
            let mut index = 0;
            while index < pending.len() {
                if pending[index].signal.is_reached()? {
                    finished.push(pending.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            finished
        };
        if finished.is_empty() {
            return Ok(0);
        }
        {
            // Pools are externally synchronized with `begin`.
            let mut pools = self.pools.lock();
            for op in finished.iter_mut() {
                op.free_command_buffer(&mut pools);
            }
        }
        let count = finished.len();
        // Payloads are released with no lock held.
        drop(finished);
        Ok(count)
    }

    /// Number of submitted operations not yet reclaimed.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TransientPools {
    fn drop(&mut self) {
        if self.pending.get_mut().is_empty() {
            return;
        }
        if let Err(err) = self.device.wait_idle() {
            tracing::error!(%err, "Failed to wait for transient submissions before teardown");
        }
        self.pending.get_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::QueueFamilies, headless::HeadlessBackend};
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    fn device() -> (Device, Arc<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        let families = QueueFamilies {
            graphics: 0,
            compute: 0,
            transfer: 1,
            decode: Some(2),
            encode: None,
        };
        (Device::new(backend.clone(), families), backend)
    }

    struct DropObserver(Arc<AtomicBool>);
    impl Drop for DropObserver {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn collect_with_nothing_pending() {
        let (device, backend) = device();
        let pools = TransientPools::new(device);
        assert_eq!(pools.garbage_collect(0).unwrap(), 0);
        assert!(backend.events().is_empty());
        assert_eq!(backend.command_pool_count(), 0);
    }

    #[test]
    fn pools_are_created_per_family() {
        let (device, backend) = device();
        let pools = TransientPools::new(device);
        let a = pools.begin(1).unwrap();
        let b = pools.begin(1).unwrap();
        let c = pools.begin(2).unwrap();
        assert_eq!(backend.command_pool_count(), 2);
        assert_eq!(c.family_index(), 2);
        pools.end(a, None, &[]).unwrap();
        pools.end(b, None, &[]).unwrap();
        pools.end(c, None, &[]).unwrap();
        assert_eq!(pools.garbage_collect(0).unwrap(), 3);
        assert_eq!(backend.live_command_buffers(), 0);
    }

    #[test]
    fn payload_outlives_the_submission() {
        let (device, backend) = device();
        let pools = TransientPools::new(device);
        let dropped = Arc::new(AtomicBool::new(false));

        backend.set_hold(true);
        let cb = pools.begin(1).unwrap();
        let signal = pools
            .end(cb, Some(Box::new(DropObserver(dropped.clone()))), &[])
            .unwrap();

        assert_eq!(pools.garbage_collect(0).unwrap(), 0);
        assert_eq!(pools.garbage_collect(1_000_000).unwrap(), 0);
        assert!(!dropped.load(Ordering::SeqCst));
        assert!(!signal.is_reached().unwrap());
        assert_eq!(pools.pending(), 1);

        backend.set_hold(false);
        assert!(signal.is_reached().unwrap());
        assert_eq!(pools.garbage_collect(0).unwrap(), 1);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(pools.pending(), 0);
    }

    #[test]
    fn operations_use_independent_semaphores() {
        let (device, backend) = device();
        let pools = TransientPools::new(device);
        let first = pools.end(pools.begin(1).unwrap(), None, &[]).unwrap();
        let second = pools.end(pools.begin(1).unwrap(), None, &[]).unwrap();
        assert_ne!(first.semaphore, second.semaphore);
        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(submissions[1].waits.is_empty());
        assert_eq!(submissions[0].family, 1);
    }

    #[test]
    fn finished_operations_are_reclaimed_alone() {
        let (device, backend) = device();
        let pools = TransientPools::new(device.clone());
        let gate = SyncPoint::new(SharedSemaphore::new(device, 0).unwrap(), 1);
        let gated_dropped = Arc::new(AtomicBool::new(false));
        let free_dropped = Arc::new(AtomicBool::new(false));

        // Separate families, so queue order does not hold the ungated one back.
        let gated = pools
            .end(
                pools.begin(2).unwrap(),
                Some(Box::new(DropObserver(gated_dropped.clone()))),
                &[gate.wait_info(vk::PipelineStageFlags2::ALL_COMMANDS)],
            )
            .unwrap();
        let ungated = pools
            .end(
                pools.begin(1).unwrap(),
                Some(Box::new(DropObserver(free_dropped.clone()))),
                &[],
            )
            .unwrap();
        assert!(ungated.is_reached().unwrap());
        assert!(!gated.is_reached().unwrap());

        assert_eq!(pools.garbage_collect(0).unwrap(), 1);
        assert!(free_dropped.load(Ordering::SeqCst));
        assert!(!gated_dropped.load(Ordering::SeqCst));
        assert_eq!(pools.pending(), 1);
        assert_eq!(backend.live_command_buffers(), 1);

        gate.semaphore.signal(1).unwrap();
        assert_eq!(pools.garbage_collect(0).unwrap(), 1);
        assert!(gated_dropped.load(Ordering::SeqCst));
        assert_eq!(backend.live_command_buffers(), 0);
    }

    struct LockObserver {
        pools: Arc<TransientPools>,
        backend: Arc<HeadlessBackend>,
        seen: Arc<Mutex<Option<(bool, usize)>>>,
    }
    impl Drop for LockObserver {
        fn drop(&mut self) {
            let pools_free = self.pools.pools.try_lock().is_some();
            *self.seen.lock() = Some((pools_free, self.backend.live_command_buffers()));
        }
    }

    #[test]
    fn command_buffers_are_freed_before_payloads() {
        let (device, backend) = device();
        let pools = Arc::new(TransientPools::new(device));
        let seen = Arc::new(Mutex::new(None));
        let payload = LockObserver {
            pools: pools.clone(),
            backend: backend.clone(),
            seen: seen.clone(),
        };
        pools
            .end(pools.begin(1).unwrap(), Some(Box::new(payload)), &[])
            .unwrap();
        assert_eq!(pools.garbage_collect(0).unwrap(), 1);
        // The payload saw its command buffer already returned and the pool map unlocked.
        assert_eq!(*seen.lock(), Some((true, 0)));
    }

    #[test]
    fn end_waits_on_dependencies() {
        let (device, backend) = device();
        let pools = TransientPools::new(device.clone());
        let gate = SyncPoint::new(SharedSemaphore::new(device, 0).unwrap(), 4);
        let cb = pools.begin(2).unwrap();
        let signal = pools
            .end(
                cb,
                None,
                &[gate.wait_info(vk::PipelineStageFlags2::ALL_COMMANDS)],
            )
            .unwrap();
        assert!(!signal.is_reached().unwrap());
        assert_eq!(pools.garbage_collect(0).unwrap(), 0);
        gate.semaphore.signal(4).unwrap();
        assert_eq!(pools.garbage_collect(0).unwrap(), 1);
        assert!(backend.submissions()[0].waits_on(gate.semaphore.raw(), 4));
    }
}
