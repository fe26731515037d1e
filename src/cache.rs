//! Memoized per-format pipelines.
//!
//! Building the pipeline and descriptor objects that convert a frame's planes into the output
//! image is expensive, and it only depends on the frame's format signature. [`PipelineCache`]
//! builds each signature once through a [`PipelineFactory`] and hands out `Arc` handles.
//!
//! A frame that uses a pipeline retains its handle in the frame slot's dependency list
//! (see [`Frame::retain`](crate::frame::Frame::retain)), so a pipeline stays alive as long as
//! any in-flight command buffer references it, whether or not the cache still does. Entries are
//! currently never evicted.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{Result, format::PixelFormat, plane::FrameData};

/// The format signature a pipeline is specialized for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub plane_formats: SmallVec<[vk::Format; 3]>,
    pub output_format: vk::Format,
    pub pixel_format: PixelFormat,
}

impl PipelineKey {
    pub fn for_frame(frame: &FrameData, output_format: vk::Format) -> Self {
        Self {
            plane_formats: frame.plane_formats(),
            output_format,
            pixel_format: frame.pixel_format(),
        }
    }
}

/// Builds the object cached for a key. Implemented by the renderer.
pub trait PipelineFactory {
    type Pipeline: Send + Sync + 'static;

    /// Called on a cache miss. Only GPU allocation failures should be reported.
    fn create(&self, key: &PipelineKey) -> Result<Self::Pipeline>;
}

pub struct PipelineCache<F: PipelineFactory> {
    factory: F,
    entries: Mutex<HashMap<PipelineKey, Arc<F::Pipeline>>>,
}

impl<F: PipelineFactory> PipelineCache<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached pipeline for `key`, building it on first use.
    pub fn get_or_create(&self, key: &PipelineKey) -> Result<Arc<F::Pipeline>> {
        let mut entries = self.entries.lock();
        if let Some(pipeline) = entries.get(key) {
            return Ok(pipeline.clone());
        }
        tracing::debug!(
            pixel_format = ?key.pixel_format,
            output_format = ?key.output_format,
            "Pipeline cache miss"
        );
        let pipeline = Arc::new(self.factory.create(key)?);
        entries.insert(key.clone(), pipeline.clone());
        Ok(pipeline)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl PipelineFactory for CountingFactory {
        type Pipeline = (vk::Format, usize);

        fn create(&self, key: &PipelineKey) -> Result<Self::Pipeline> {
            Ok((key.output_format, self.created.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn key(pixel_format: PixelFormat) -> PipelineKey {
        PipelineKey {
            plane_formats: SmallVec::from_slice(&[vk::Format::R8_UNORM, vk::Format::R8G8_UNORM]),
            output_format: vk::Format::B8G8R8A8_UNORM,
            pixel_format,
        }
    }

    #[test]
    fn same_signature_shares_one_pipeline() {
        let cache = PipelineCache::new(CountingFactory::default());
        let a = cache.get_or_create(&key(PixelFormat::Nv12)).unwrap();
        let b = cache.get_or_create(&key(PixelFormat::Nv12)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get_or_create(&key(PixelFormat::P010)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.factory().created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn handles_outlive_the_cache() {
        let cache = PipelineCache::new(CountingFactory::default());
        let pipeline = cache.get_or_create(&key(PixelFormat::Nv12)).unwrap();
        drop(cache);
        assert_eq!(pipeline.0, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(Arc::strong_count(&pipeline), 1);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        struct Failing;
        impl PipelineFactory for Failing {
            type Pipeline = ();
            fn create(&self, _key: &PipelineKey) -> Result<()> {
                Err(crate::Error::Allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
            }
        }
        let cache = PipelineCache::new(Failing);
        assert!(cache.get_or_create(&key(PixelFormat::Nv12)).is_err());
        assert!(cache.is_empty());
    }
}
