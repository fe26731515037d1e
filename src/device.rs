//! Logical device context.
//!
//! [`Device`] bundles the three things every other component needs: the
//! [backend](crate::backend::DeviceBackend) that talks to the GPU, the immutable
//! [`QueueFamilies`] description, and the per-queue [submission locks](QueueMutexMap).
//! It is reference-counted and cheap to clone; every GPU object created by this crate keeps a
//! `Device` alive for as long as it needs to destroy its handles.
//!
//! There is no global device state. Queue family indices are read from the context value passed
//! to constructors.
//!
//! ```
//! # use scoria::{Device, device::QueueFamilies, headless::HeadlessBackend};
//! # use std::sync::Arc;
//! let families = QueueFamilies::single(0);
//! let device = Device::new(Arc::new(HeadlessBackend::new()), families);
//! assert_eq!(device.families().graphics, 0);
//! ```

use std::{fmt::Debug, ops::Deref, sync::Arc};

use ash::vk;

use crate::{
    backend::DeviceBackend,
    queue::{QueueGuard, QueueMutexMap},
};

/// A trait for types created from a [`Device`].
pub trait HasDevice {
    /// Returns a reference to the device.
    fn device(&self) -> &Device;
}

/// Queue family indices discovered at device creation.
///
/// Families may alias: on many GPUs the graphics family also serves compute and transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    /// Video decode family, if the device has one.
    pub decode: Option<u32>,
    /// Video encode family, if the device has one.
    pub encode: Option<u32>,
}

impl QueueFamilies {
    /// A device where a single family does everything and there is no video hardware.
    pub fn single(family: u32) -> Self {
        Self {
            graphics: family,
            compute: family,
            transfer: family,
            decode: None,
            encode: None,
        }
    }

    /// All distinct family indices, in ascending order.
    pub fn distinct(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.compute, self.transfer]
            .into_iter()
            .chain(self.decode)
            .chain(self.encode)
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// A reference-counted device context.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    backend: Arc<dyn DeviceBackend>,
    families: QueueFamilies,
    queues: QueueMutexMap,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.0.families).finish()
    }
}

impl Device {
    /// Wraps a backend together with its queue family layout.
    pub fn new(backend: Arc<dyn DeviceBackend>, families: QueueFamilies) -> Self {
        tracing::info!(
            graphics = families.graphics,
            compute = families.compute,
            transfer = families.transfer,
            decode = ?families.decode,
            encode = ?families.encode,
            "Created device context"
        );
        Self(Arc::new(DeviceInner {
            backend,
            families,
            queues: QueueMutexMap::new(),
        }))
    }

    /// Returns the queue family layout.
    pub fn families(&self) -> &QueueFamilies {
        &self.0.families
    }

    /// Returns the backend shared by every object created from this device.
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.0.backend
    }

    /// Returns the per-queue submission lock map.
    pub fn queues(&self) -> &QueueMutexMap {
        &self.0.queues
    }

    /// Locks queue `(family, index)` for submission.
    ///
    /// See [`QueueMutexMap::acquire`] for the lock ordering rule.
    pub fn lock_queue(&self, family: u32, index: u32) -> QueueGuard {
        self.0.queues.acquire(&*self.0.backend, family, index)
    }

    /// Blocks until the whole device is idle.
    ///
    /// Needed before releasing any resource that a submission may still reference, since
    /// submitted work cannot be cancelled.
    pub fn wait_idle(&self) -> crate::Result<()> {
        self.0.backend.wait_idle()?;
        Ok(())
    }

    /// Returns the family that should be used for a given capability.
    pub fn family_for(&self, flags: vk::QueueFlags) -> crate::Result<u32> {
        let families = &self.0.families;
        if flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR) {
            families
                .decode
                .ok_or(crate::Error::MissingQueueFamily(flags))
        } else if flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR) {
            families
                .encode
                .ok_or(crate::Error::MissingQueueFamily(flags))
        } else if flags.contains(vk::QueueFlags::GRAPHICS) {
            Ok(families.graphics)
        } else if flags.contains(vk::QueueFlags::COMPUTE) {
            Ok(families.compute)
        } else {
            Ok(families.transfer)
        }
    }
}

impl Deref for Device {
    type Target = dyn DeviceBackend;

    fn deref(&self) -> &Self::Target {
        &*self.0.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn distinct_families_are_sorted_and_deduplicated() {
        let families = QueueFamilies {
            graphics: 0,
            compute: 0,
            transfer: 1,
            decode: Some(2),
            encode: Some(1),
        };
        assert_eq!(families.distinct(), vec![0, 1, 2]);
    }

    #[test]
    fn family_for_video_requires_hardware() {
        let device = Device::new(Arc::new(HeadlessBackend::new()), QueueFamilies::single(0));
        assert_eq!(device.family_for(vk::QueueFlags::TRANSFER).unwrap(), 0);
        assert!(matches!(
            device.family_for(vk::QueueFlags::VIDEO_DECODE_KHR),
            Err(crate::Error::MissingQueueFamily(_))
        ));
    }

    #[test]
    fn clones_compare_equal() {
        let device = Device::new(Arc::new(HeadlessBackend::new()), QueueFamilies::single(0));
        let other = Device::new(Arc::new(HeadlessBackend::new()), QueueFamilies::single(0));
        assert_eq!(device, device.clone());
        assert_ne!(device, other);
    }
}
