//! Per-queue submission locks.
//!
//! Submitting to the same `VkQueue` from two threads at once is undefined behavior, and the
//! same hardware queue is reached from several places: transient ownership transfers, the
//! frame loop, presentation, and external decoders that share the device. [`QueueMutexMap`]
//! hands out one lock per `(queue family, queue index)` pair.
//!
//! The map itself is guarded by a short-held lock that is only taken to look up or lazily
//! insert a key. It is never held while a queue lock is held by the caller, so submissions to
//! different queues never contend.
//!
//! # Lock ordering
//!
//! Never hold the lock for queue A while acquiring the lock for queue B unless `A < B` in the
//! `(family, index)` order. [`QueueMutexMap::acquire_pair`] does this for you.

use std::{collections::HashMap, ops::Deref, sync::Arc};

use ash::vk;
use parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard};

use crate::backend::DeviceBackend;

/// `(queue family, queue index)`.
pub type QueueKey = (u32, u32);

/// Lazily populated map of per-queue submission locks.
#[derive(Default)]
pub struct QueueMutexMap {
    queues: Mutex<HashMap<QueueKey, Arc<Mutex<vk::Queue>>>>,
}

/// Exclusive access to one queue. Released on drop, on every exit path.
pub struct QueueGuard {
    key: QueueKey,
    guard: ArcMutexGuard<RawMutex, vk::Queue>,
}

impl QueueGuard {
    pub fn family_index(&self) -> u32 {
        self.key.0
    }
    pub fn queue_index(&self) -> u32 {
        self.key.1
    }
    pub fn key(&self) -> QueueKey {
        self.key
    }
}

impl Deref for QueueGuard {
    type Target = vk::Queue;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl QueueMutexMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, backend: &dyn DeviceBackend, key: QueueKey) -> Arc<Mutex<vk::Queue>> {
        let mut queues = self.queues.lock();
        queues
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(
                    queue_family = key.0,
                    queue_index = key.1,
                    "Created queue submission lock"
                );
                Arc::new(Mutex::new(backend.get_queue(key.0, key.1)))
            })
            .clone()
    }

    /// Locks queue `(family, index)`, blocking while another caller holds it.
    pub fn acquire(&self, backend: &dyn DeviceBackend, family: u32, index: u32) -> QueueGuard {
        let key = (family, index);
        // The map lock is released before blocking on the queue lock.
        let queue = self.entry(backend, key);
        QueueGuard {
            key,
            guard: queue.lock_arc(),
        }
    }

    /// Locks queue `(family, index)` if nobody else holds it.
    pub fn try_acquire(
        &self,
        backend: &dyn DeviceBackend,
        family: u32,
        index: u32,
    ) -> Option<QueueGuard> {
        let key = (family, index);
        let queue = self.entry(backend, key);
        queue.try_lock_arc().map(|guard| QueueGuard { key, guard })
    }

    /// Locks two queues in the global order. If both keys are equal only one guard is
    /// returned.
    pub fn acquire_pair(
        &self,
        backend: &dyn DeviceBackend,
        a: QueueKey,
        b: QueueKey,
    ) -> (QueueGuard, Option<QueueGuard>) {
        if a == b {
            return (self.acquire(backend, a.0, a.1), None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.acquire(backend, first.0, first.1);
        let second = self.acquire(backend, second.0, second.1);
        if a < b {
            (first, Some(second))
        } else {
            (second, Some(first))
        }
    }

    /// Number of queues that have been locked at least once.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_is_exclusive() {
        let backend = HeadlessBackend::new();
        let map = QueueMutexMap::new();
        let guard = map.acquire(&backend, 0, 0);
        assert!(map.try_acquire(&backend, 0, 0).is_none());
        // A different queue is not blocked.
        assert!(map.try_acquire(&backend, 1, 0).is_some());
        drop(guard);
        assert!(map.try_acquire(&backend, 0, 0).is_some());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn guard_resolves_queue_handle() {
        let backend = HeadlessBackend::new();
        let map = QueueMutexMap::new();
        let first = *map.acquire(&backend, 2, 0);
        let second = *map.acquire(&backend, 2, 0);
        assert_eq!(first, second);
        assert_eq!(backend.get_queue(2, 0), first);
    }

    #[test]
    fn pair_is_returned_in_caller_order() {
        let backend = HeadlessBackend::new();
        let map = QueueMutexMap::new();
        let (a, b) = map.acquire_pair(&backend, (2, 0), (0, 0));
        assert_eq!(a.key(), (2, 0));
        assert_eq!(b.unwrap().key(), (0, 0));
        drop(a);
        let (a, b) = map.acquire_pair(&backend, (1, 0), (1, 0));
        assert_eq!(a.family_index(), 1);
        assert!(b.is_none());
    }

    #[test]
    fn contended_submissions_are_serialized() {
        let backend = Arc::new(HeadlessBackend::new());
        let map = Arc::new(QueueMutexMap::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                let map = map.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = map.acquire(&*backend, 0, 0);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
