//! # Scoria
//!
//! Cross-queue GPU synchronization and resource lifetime management for Vulkan video playback.
//!
//! A video player moves every frame across several hardware queues: a decode queue writes it,
//! a transfer queue may copy it, the graphics queue samples it, and an encode queue may read the
//! rendered output. Scoria keeps track of who owns each image plane, in which layout, and when
//! the last GPU access to it will have completed, and emits exactly the barriers, semaphore
//! waits and queue family ownership transfers needed to hand it to the next consumer.
//!
//! ## Overview
//!
//! ### Device
//!
//! Everything is written against the [`DeviceBackend`](backend::DeviceBackend) trait. A
//! [`Device`] bundles a backend with its [`QueueFamilies`](device::QueueFamilies) and the
//! per-queue submission locks.
//!
//! - [`VulkanBackend`](vulkan::VulkanBackend) drives a real GPU through `ash`.
//! - [`HeadlessBackend`](headless::HeadlessBackend) executes submissions in software and records
//!   them, for tests.
//!
//! ```
//! use scoria::prelude::*;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(HeadlessBackend::new());
//! let device = Device::new(backend, QueueFamilies::single(0));
//! let semaphore = SharedSemaphore::new(device.clone(), 0).unwrap();
//! semaphore.signal(3).unwrap();
//! SyncPoint::new(semaphore, 2).wait(INFINITE).unwrap();
//! ```
//!
//! ### Planes
//!
//! Decoded frames arrive as [`FrameData`](plane::FrameData): one or more
//! [`ImagePlane`](plane::ImagePlane)s plus whatever keeps their memory alive. Before a plane is
//! used, [`request_usage`](plane::ImagePlane::request_usage) moves it to the consumer's queue
//! family and layout and returns the [`SyncPoint`](sync::SyncPoint) to wait on. Ownership
//! transfers are recorded into short-lived command buffers managed by
//! [`TransientPools`](transient::TransientPools).
//!
//! ### Frames
//!
//! [`FramePacer`](frame::FramePacer) bounds how far the CPU runs ahead of the GPU, and keeps
//! every object a frame's GPU work references alive until that work has completed. It renders
//! into any [`PresentTarget`](present::PresentTarget): a window
//! [`Swapchain`](swapchain::Swapchain), an encoder-facing
//! [`OffscreenTarget`](offscreen::OffscreenTarget), or the headless surface.
//!
//! ### Sources
//!
//! [`FrameSource`](source::FrameSource) picks the frame visible at a playback time, either from
//! a decoder thread ([`StreamingSource`](source::StreamingSource)) or from a clip uploaded up
//! front ([`PreloadedSource`](source::PreloadedSource), see [`upload`]).
//!
//! ## Requirements
//!
//! - Vulkan 1.3 with timeline semaphores and synchronization2

pub mod alloc;
pub mod backend;
pub mod cache;
pub mod command;
pub mod device;
mod error;
pub mod format;
pub mod frame;
pub mod headless;
pub mod offscreen;
pub mod plane;
pub mod present;
pub mod queue;
pub mod source;
pub mod swapchain;
pub mod sync;
pub mod tracking;
pub mod transient;
pub mod upload;
pub mod vulkan;

pub use device::{Device, HasDevice};
pub use error::{Error, Result};

pub use ash;

pub mod prelude {
    pub use crate::{
        Device, Error, HasDevice, Result, ash,
        ash::vk,
        cache::{PipelineCache, PipelineFactory, PipelineKey},
        device::QueueFamilies,
        format::PixelFormat,
        frame::{Frame, FramePacer, FrameStatus, PacerConfig},
        headless::{HeadlessBackend, HeadlessSurface},
        plane::{FrameData, FrameDescriptor, ImagePlane, PlaneUsage},
        present::{AcquiredImage, PresentTarget},
        source::{FrameSource, PreloadedSource, ReadMode, RepeatRemapper, StreamingSource},
        sync::{INFINITE, SharedSemaphore, SyncPoint},
        tracking::{Access, ResourceState},
        transient::TransientPools,
    };
}
