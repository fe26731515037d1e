//! Error types.
//!
//! Every fallible operation in this crate returns [`Result`]. The variants follow the three
//! failure classes the engine distinguishes:
//!
//! - **Fatal device errors** ([`Error::Device`], [`Error::Allocation`], ...) are never retried.
//! - **Recoverable presentation errors** ([`Error::SurfaceOutOfDate`]) are handled by the frame
//!   pacer with a recreate-and-retry loop.
//! - **Timeouts** ([`Error::Timeout`]) are reported as their own variant so a timed-out wait can
//!   never be mistaken for success. Whether a timeout is fatal is up to the caller.

use ash::vk;
use thiserror::Error;

use crate::format::PixelFormat;

/// Errors produced by the synchronization engine and its backends.
#[derive(Error, Debug)]
pub enum Error {
    /// A device-level failure: allocation failure, device loss, or an API contract violation.
    #[error("Vulkan device error: {0}")]
    Device(vk::Result),

    /// A bounded wait expired before the semaphore reached its target value.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// The presentation surface no longer matches the swapchain and must be recreated.
    #[error("Presentation surface is out of date")]
    SurfaceOutOfDate,

    /// No queue family on the device supports the requested capabilities.
    #[error("No queue family supports {0:?}")]
    MissingQueueFamily(vk::QueueFlags),

    /// The Vulkan loader could not be found or loaded.
    #[error("Vulkan loader not available: {0}")]
    Loading(#[from] ash::LoadingError),

    /// No Vulkan-capable physical device meets the engine's requirements.
    #[error("No suitable Vulkan physical device found")]
    NoDevice,

    /// Memory allocation through the allocator failed.
    #[error("GPU memory allocation failed: {0}")]
    Allocation(vk::Result),

    /// The consumer on the other end of a frame channel has gone away.
    #[error("Frame consumer disconnected")]
    Disconnected,

    /// The pixel format has no GPU mapping in the format table.
    #[error("Unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT => Error::Timeout,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Error::SurfaceOutOfDate,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Error::Allocation(result)
            }
            other => Error::Device(other),
        }
    }
}

impl Error {
    /// Returns `true` for errors that must abort the frame loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::SurfaceOutOfDate | Error::Timeout)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
