//! Presentable image providers.
//!
//! The [frame pacer](crate::frame::FramePacer) renders into whatever a [`PresentTarget`] hands
//! it. Implementations:
//!
//! - [`Swapchain`](crate::swapchain::Swapchain): a window surface.
//! - [`OffscreenTarget`](crate::offscreen::OffscreenTarget): a ring of images drained by an
//!   encoder.
//! - [`HeadlessSurface`](crate::headless::HeadlessSurface): no images at all, for tests.
//!
//! Both [`acquire`](PresentTarget::acquire) and [`present`](PresentTarget::present) may report
//! [`Error::SurfaceOutOfDate`](crate::Error::SurfaceOutOfDate). The caller then calls
//! [`recreate`](PresentTarget::recreate) and tries again.

use ash::vk;
use glam::UVec2;

use crate::{
    Result,
    sync::{SharedSemaphore, SyncPoint},
};

/// An image handed out by [`PresentTarget::acquire`].
#[derive(Debug, Clone)]
pub struct AcquiredImage {
    /// Index of the image within the target.
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: UVec2,
    pub format: vk::Format,
    /// Binary semaphore the rendering submission must wait on before writing the image.
    pub acquire_semaphore: Option<SharedSemaphore>,
    /// Binary semaphore the rendering submission must signal for the presentation engine.
    pub present_semaphore: Option<SharedSemaphore>,
    /// Timeline point the rendering submission must wait on before writing the image.
    pub ready: Option<SyncPoint>,
}

/// A provider of images to render into.
pub trait PresentTarget {
    /// Obtains the next image to render into.
    fn acquire(&mut self) -> Result<AcquiredImage>;

    /// Hands a rendered image back. `rendered` is reached once the rendering submission has
    /// completed on the GPU.
    fn present(&mut self, image: &AcquiredImage, rendered: &SyncPoint) -> Result<()>;

    /// Rebuilds the target after it went out of date. May only fail fatally.
    fn recreate(&mut self) -> Result<()>;

    fn extent(&self) -> UVec2;

    fn format(&self) -> vk::Format;

    /// The layout images must be in when handed to [`present`](Self::present).
    fn final_layout(&self) -> vk::ImageLayout;
}
