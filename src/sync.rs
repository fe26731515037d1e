//! GPU synchronization primitives.
//!
//! This module provides the counting semaphore that every cross-queue and host/GPU dependency
//! in the engine is expressed with.
//!
//! # Key Types
//!
//! - [`Semaphore`]: A wrapper around a timeline (or, for presentation, binary) semaphore with a
//!   cached, monotonically increasing counter value.
//! - [`SharedSemaphore`]: Reference-counted semaphore for shared ownership. Hashes and compares
//!   by identity.
//! - [`SyncPoint`]: A `(semaphore, value)` pair. "The work is done once the semaphore reaches
//!   this value."
//!
//! # Visibility
//!
//! Once [`Semaphore::wait`] returns `Ok`, every GPU side effect of every submission that
//! signals the semaphore to a value `>=` the waited value is visible. There is no other ordering
//! between independently submitted command buffers.

use std::{
    fmt::Debug,
    hash::Hash,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::vk;

use crate::{Device, HasDevice, Result};

/// Wait forever.
pub const INFINITE: u64 = u64::MAX;

/// A semaphore with a 64-bit counter that never decreases.
///
/// # Cached Counter Value
///
/// The counter value is cached in an [`AtomicU64`] and only ever raised with `fetch_max`, so
/// two successive reads from any thread observe non-decreasing values even if the device
/// reports a stale value in between.
///
/// # Binary vs Timeline
///
/// Timeline semaphores are used everywhere except swapchain acquire/present, which the
/// presentation engine only accepts binary semaphores for. Binary semaphores cannot be read or
/// waited on from the host.
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
    value: AtomicU64,
    binary: bool,
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(if self.binary {
            "BinarySemaphore"
        } else {
            "TimelineSemaphore"
        })
        .field(&self.handle)
        .field(&self.value.load(Ordering::Relaxed))
        .finish()
    }
}

impl Semaphore {
    /// Creates a new timeline semaphore with the given initial value.
    pub fn new(device: Device, initial_value: u64) -> Result<Self> {
        let handle = device.create_semaphore(vk::SemaphoreType::TIMELINE, initial_value)?;
        Ok(Self {
            device,
            handle,
            value: AtomicU64::new(initial_value),
            binary: false,
        })
    }

    /// Creates a new binary semaphore for the swapchain.
    pub fn new_binary(device: Device) -> Result<Self> {
        let handle = device.create_semaphore(vk::SemaphoreType::BINARY, 0)?;
        Ok(Self {
            device,
            handle,
            value: AtomicU64::new(0),
            binary: true,
        })
    }

    /// Returns `true` if this is a binary semaphore.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.handle
    }

    /// Returns the current counter value without blocking.
    ///
    /// Queries the device and raises the cached value.
    pub fn current_value(&self) -> Result<u64> {
        assert!(!self.binary, "Binary semaphores have no host-visible counter");
        let device_value = self.device.semaphore_counter_value(self.handle)?;
        let old_value = self.value.fetch_max(device_value, Ordering::AcqRel);
        Ok(old_value.max(device_value))
    }

    /// Returns the last value observed by this process without querying the device.
    pub fn cached_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Returns `true` if the semaphore has reached `value`.
    pub fn is_signaled(&self, value: u64) -> Result<bool> {
        if self.cached_value() >= value {
            return Ok(true);
        }
        Ok(self.current_value()? >= value)
    }

    /// Signals the semaphore to `value` from the host.
    ///
    /// No-op if the semaphore is already at or past the given value.
    pub fn signal(&self, value: u64) -> Result<()> {
        assert!(!self.binary);
        if self.cached_value() >= value {
            return Ok(());
        }
        self.device.signal_semaphore(self.handle, value)?;
        self.value.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Blocks until the counter reaches `value` or `timeout` nanoseconds elapse.
    ///
    /// Returns [`Error::Timeout`](crate::Error::Timeout) on expiry. A timed-out wait must not be
    /// treated as completion. Returns early if the cached value is already sufficient.
    pub fn wait(&self, value: u64, timeout: u64) -> Result<()> {
        assert!(!self.binary, "Binary semaphores cannot be waited on from the host");
        if self.cached_value() >= value {
            return Ok(());
        }
        self.device
            .wait_semaphores(&[self.handle], &[value], false, timeout)?;
        self.value.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Async version of [`wait`](Self::wait). The blocking wait runs on the `blocking` thread
    /// pool.
    pub async fn wait_async(self: &Arc<Self>, value: u64) -> Result<()> {
        if self.is_signaled(value)? {
            return Ok(());
        }
        let this = self.clone();
        blocking::unblock(move || this.wait(value, INFINITE)).await
    }
}

impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

/// A reference-counted semaphore for shared ownership.
///
/// Equality, ordering and hashing are by identity, so a `SharedSemaphore` can key a map of
/// pending waits.
#[derive(Clone)]
pub struct SharedSemaphore(Arc<Semaphore>);

impl Debug for SharedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl Hash for SharedSemaphore {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}
impl Ord for SharedSemaphore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0))
    }
}
impl PartialOrd for SharedSemaphore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for SharedSemaphore {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for SharedSemaphore {}
impl Deref for SharedSemaphore {
    type Target = Arc<Semaphore>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl HasDevice for SharedSemaphore {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl SharedSemaphore {
    pub fn new(device: Device, initial_value: u64) -> Result<Self> {
        Ok(SharedSemaphore(Arc::new(Semaphore::new(
            device,
            initial_value,
        )?)))
    }
    pub fn new_binary(device: Device) -> Result<Self> {
        Ok(SharedSemaphore(Arc::new(Semaphore::new_binary(device)?)))
    }
}

/// A point on a semaphore's timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPoint {
    pub semaphore: SharedSemaphore,
    pub value: u64,
}

impl SyncPoint {
    pub fn new(semaphore: SharedSemaphore, value: u64) -> Self {
        Self { semaphore, value }
    }

    /// Blocks until this point is reached.
    pub fn wait(&self, timeout: u64) -> Result<()> {
        self.semaphore.wait(self.value, timeout)
    }

    pub fn is_reached(&self) -> Result<bool> {
        self.semaphore.is_signaled(self.value)
    }

    /// Describes this point as a submission wait for the given stages.
    pub fn wait_info(
        &self,
        stage_mask: vk::PipelineStageFlags2,
    ) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo {
            semaphore: self.semaphore.raw(),
            value: self.value,
            stage_mask,
            ..Default::default()
        }
    }

    /// Describes this point as a submission signal after the given stages.
    pub fn signal_info(
        &self,
        stage_mask: vk::PipelineStageFlags2,
    ) -> vk::SemaphoreSubmitInfo<'static> {
        self.wait_info(stage_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::QueueFamilies, headless::HeadlessBackend};

    fn device() -> (Device, Arc<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        (
            Device::new(backend.clone(), QueueFamilies::single(0)),
            backend,
        )
    }

    #[test]
    fn counter_is_monotonic() {
        let (device, _backend) = device();
        let semaphore = Semaphore::new(device, 3).unwrap();
        let mut last = semaphore.current_value().unwrap();
        for value in [5, 4, 9, 9, 2, 12] {
            semaphore.signal(value).unwrap();
            let now = semaphore.current_value().unwrap();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 12);
    }

    #[test]
    fn wait_times_out_without_success() {
        let (device, _backend) = device();
        let semaphore = Semaphore::new(device, 0).unwrap();
        assert!(matches!(
            semaphore.wait(1, 1_000_000),
            Err(crate::Error::Timeout)
        ));
        assert_eq!(semaphore.cached_value(), 0);
    }

    #[test]
    fn wait_returns_after_host_signal() {
        let (device, _backend) = device();
        let semaphore = SharedSemaphore::new(device, 0).unwrap();
        let signaller = semaphore.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            signaller.signal(2).unwrap();
        });
        semaphore.wait(2, INFINITE).unwrap();
        assert!(semaphore.is_signaled(2).unwrap());
        thread.join().unwrap();
    }

    #[test]
    fn shared_semaphores_compare_by_identity() {
        let (device, _backend) = device();
        let a = SharedSemaphore::new(device.clone(), 0).unwrap();
        let b = SharedSemaphore::new(device, 0).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        let point = SyncPoint::new(a.clone(), 1);
        let info = point.wait_info(vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(info.semaphore, a.raw());
        assert_eq!(info.value, 1);
    }

    #[test]
    fn dropping_destroys_the_handle() {
        let (device, backend) = device();
        let semaphore = Semaphore::new(device, 0).unwrap();
        let handle = semaphore.raw();
        assert!(backend.semaphore_exists(handle));
        drop(semaphore);
        assert!(!backend.semaphore_exists(handle));
    }
}
