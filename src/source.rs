//! Frame sources.
//!
//! A [`FrameSource`] answers one question per rendered frame: which decoded frame is visible at
//! playback time `t`? There are two kinds:
//!
//! - [`StreamingSource`] pulls frames from a decoder running on another thread.
//! - [`PreloadedSource`] holds a short clip fully decoded in one array image.
//!
//! Both hand out [`FrameDescriptor`]s. Neither touches plane state; that is left to whoever
//! consumes the descriptor.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::Deserialize;

use crate::{
    Result,
    plane::{FrameData, FrameDescriptor},
};

/// Clips with fewer frames than this are preloaded in [`ReadMode::Auto`].
pub const AUTO_PRELOAD_MAX_FRAMES: usize = 64;

/// How a clip is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Preload short clips, stream everything else.
    #[default]
    Auto,
    Stream,
    Preload,
}

impl ReadMode {
    /// Decides whether a clip with `frame_count` frames (if known) is preloaded.
    pub fn should_preload(self, frame_count: Option<usize>) -> bool {
        match self {
            ReadMode::Auto => frame_count.is_some_and(|n| n < AUTO_PRELOAD_MAX_FRAMES),
            ReadMode::Stream => false,
            ReadMode::Preload => true,
        }
    }
}

/// Maps an ever-increasing playback clock onto a looping clip.
#[derive(Debug, Clone, Copy)]
pub struct RepeatRemapper {
    total: Duration,
}

impl RepeatRemapper {
    pub fn new(total: Duration) -> Self {
        assert!(!total.is_zero(), "Cannot loop a clip of zero duration");
        Self { total }
    }

    pub fn remap(&self, time: Duration) -> Duration {
        let nanos = time.as_nanos() % self.total.as_nanos();
        Duration::from_nanos(nanos as u64)
    }

    /// How many times the clip has wrapped around at `time`.
    pub fn iteration(&self, time: Duration) -> u64 {
        (time.as_nanos() / self.total.as_nanos()) as u64
    }
}

/// A decoded frame with its timing.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame: FrameDescriptor,
    pub pts: Duration,
    pub duration: Duration,
    /// The seek generation the decoder was in when it produced the frame.
    pub generation: u64,
}

impl DecodedFrame {
    pub fn end(&self) -> Duration {
        self.pts + self.duration
    }
}

/// Commands sent back to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderCommand {
    Seek { time: Duration, generation: u64 },
}

/// The decoder's end of a [`StreamingSource`].
pub struct DecoderEndpoint {
    frames: Sender<DecodedFrame>,
    commands: Receiver<DecoderCommand>,
    generation: u64,
}

impl DecoderEndpoint {
    /// Returns the most recent pending seek, if any, and switches to its generation. Older
    /// seeks are superseded.
    pub fn next_seek(&mut self) -> Option<Duration> {
        let mut seek = None;
        loop {
            match self.commands.try_recv() {
                Ok(DecoderCommand::Seek { time, generation }) => {
                    self.generation = generation;
                    seek = Some(time);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return seek,
            }
        }
    }

    /// Hands a frame to the player, blocking while the queue is full.
    ///
    /// Returns `false` once the player has gone away.
    pub fn send(&self, frame: FrameDescriptor, pts: Duration, duration: Duration) -> bool {
        self.frames
            .send(DecodedFrame {
                frame,
                pts,
                duration,
                generation: self.generation,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Frames decoded on the fly.
pub struct StreamingSource {
    frames: Receiver<DecodedFrame>,
    commands: Sender<DecoderCommand>,
    generation: u64,
    current: Option<DecodedFrame>,
}

impl StreamingSource {
    /// Creates a source and the endpoint its decoder feeds. At most `capacity` frames are
    /// decoded ahead.
    pub fn new(capacity: usize) -> (Self, DecoderEndpoint) {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(capacity);
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        (
            Self {
                frames: frame_rx,
                commands: command_tx,
                generation: 0,
                current: None,
            },
            DecoderEndpoint {
                frames: frame_tx,
                commands: command_rx,
                generation: 0,
            },
        )
    }

    /// Returns the first frame still visible at `time`, dropping older ones.
    ///
    /// Blocks until the decoder delivers such a frame. Returns `None` at the end of the stream.
    pub fn frame_at(&mut self, time: Duration) -> Option<FrameDescriptor> {
        loop {
            if let Some(current) = &self.current
                && current.end() > time
            {
                return Some(current.frame.clone());
            }
            let next = self.frames.recv().ok()?;
            if next.generation != self.generation {
                tracing::trace!(
                    stale = next.generation,
                    current = self.generation,
                    "Dropping frame from before seek"
                );
                continue;
            }
            self.current = Some(next);
        }
    }

    /// Asks the decoder to restart at `time`. Frames decoded before the seek are discarded.
    pub fn seek(&mut self, time: Duration) {
        self.generation += 1;
        self.current = None;
        let command = DecoderCommand::Seek {
            time,
            generation: self.generation,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!("Seeking a stream whose decoder has stopped");
        }
    }
}

/// A clip decoded up front into the layers of one array image.
pub struct PreloadedSource {
    data: Arc<FrameData>,
    /// End time of each frame.
    timestamps: Vec<Duration>,
    cursor: usize,
}

impl PreloadedSource {
    pub fn new(data: Arc<FrameData>, timestamps: Vec<Duration>) -> Self {
        assert!(!timestamps.is_empty(), "Video stream has no frames");
        assert!(
            timestamps.is_sorted(),
            "Frame end times must be non-decreasing"
        );
        Self {
            data,
            timestamps,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// End time of the last frame.
    pub fn duration(&self) -> Duration {
        self.timestamps[self.timestamps.len() - 1]
    }

    pub fn data(&self) -> &Arc<FrameData> {
        &self.data
    }

    /// Returns the frame visible at `time`.
    ///
    /// Times must not go backwards between seeks. Returns `None` past the end of the clip.
    pub fn frame_at(&mut self, time: Duration) -> Option<FrameDescriptor> {
        if time > self.duration() {
            return None;
        }
        while self.cursor < self.timestamps.len() && time >= self.timestamps[self.cursor] {
            self.cursor += 1;
        }
        if self.cursor == self.timestamps.len() {
            return None;
        }
        Some(FrameDescriptor {
            data: self.data.clone(),
            layer: Some(self.cursor as u32),
        })
    }

    pub fn seek(&mut self, time: Duration) {
        self.cursor = self.timestamps.partition_point(|&end| end < time);
    }

    /// Blocks until the upload of the clip has completed.
    pub fn wait_for_load(&self, timeout: u64) -> Result<()> {
        let plane = self.data.plane(0);
        match plane.sync_point() {
            Some(sync) => sync.wait(timeout),
            None => Ok(()),
        }
    }
}

/// Either kind of source.
pub enum FrameSource {
    Streaming(StreamingSource),
    Preloaded(PreloadedSource),
}

impl FrameSource {
    pub fn frame_at(&mut self, time: Duration) -> Option<FrameDescriptor> {
        match self {
            FrameSource::Streaming(source) => source.frame_at(time),
            FrameSource::Preloaded(source) => source.frame_at(time),
        }
    }

    pub fn seek(&mut self, time: Duration) {
        match self {
            FrameSource::Streaming(source) => source.seek(time),
            FrameSource::Preloaded(source) => source.seek(time),
        }
    }
}

impl From<StreamingSource> for FrameSource {
    fn from(source: StreamingSource) -> Self {
        FrameSource::Streaming(source)
    }
}

impl From<PreloadedSource> for FrameSource {
    fn from(source: PreloadedSource) -> Self {
        FrameSource::Preloaded(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use glam::UVec2;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn frame_data() -> Arc<FrameData> {
        Arc::new(FrameData::new(
            std::iter::empty(),
            UVec2::new(8, 8),
            PixelFormat::Rgba,
        ))
    }

    fn tagged(tag: u32) -> FrameDescriptor {
        FrameDescriptor {
            data: frame_data(),
            layer: Some(tag),
        }
    }

    #[test]
    fn preloaded_lookup() {
        let mut source = PreloadedSource::new(frame_data(), vec![ms(10), ms(20), ms(30)]);
        assert_eq!(source.frame_at(ms(0)).unwrap().layer, Some(0));
        assert_eq!(source.frame_at(ms(10)).unwrap().layer, Some(1));
        assert_eq!(source.frame_at(ms(25)).unwrap().layer, Some(2));
        assert!(source.frame_at(ms(30)).is_none());
        assert!(source.frame_at(ms(31)).is_none());
    }

    #[test]
    fn preloaded_seek_is_lower_bound() {
        let mut source = PreloadedSource::new(frame_data(), vec![ms(10), ms(20), ms(30)]);
        source.frame_at(ms(25));
        source.seek(ms(15));
        assert_eq!(source.frame_at(ms(15)).unwrap().layer, Some(1));
        source.seek(ms(0));
        assert_eq!(source.frame_at(ms(5)).unwrap().layer, Some(0));
        source.seek(ms(20));
        assert_eq!(source.frame_at(ms(20)).unwrap().layer, Some(2));
    }

    #[test]
    fn streaming_skips_finished_frames() {
        let (mut source, decoder) = StreamingSource::new(8);
        for i in 0..4 {
            assert!(decoder.send(tagged(i), ms(i as u64 * 10), ms(10)));
        }
        assert_eq!(source.frame_at(ms(15)).unwrap().layer, Some(1));
        // Still visible.
        assert_eq!(source.frame_at(ms(19)).unwrap().layer, Some(1));
        assert_eq!(source.frame_at(ms(35)).unwrap().layer, Some(3));
        drop(decoder);
        assert!(source.frame_at(ms(40)).is_none());
    }

    #[test]
    fn streaming_discards_frames_from_before_seek() {
        let (mut source, mut decoder) = StreamingSource::new(8);
        assert!(decoder.send(tagged(0), ms(0), ms(10)));
        assert!(decoder.send(tagged(1), ms(10), ms(10)));

        source.seek(ms(500));
        assert_eq!(decoder.next_seek(), Some(ms(500)));
        assert_eq!(decoder.generation(), 1);
        assert!(decoder.send(tagged(50), ms(500), ms(10)));

        assert_eq!(source.frame_at(ms(0)).unwrap().layer, Some(50));
        assert_eq!(decoder.next_seek(), None);
    }

    #[test]
    fn only_the_latest_seek_counts() {
        let (mut source, mut decoder) = StreamingSource::new(2);
        source.seek(ms(100));
        source.seek(ms(200));
        assert_eq!(decoder.next_seek(), Some(ms(200)));
        assert_eq!(decoder.generation(), 2);
    }

    #[test]
    fn remapper_loops() {
        let remap = RepeatRemapper::new(ms(300));
        assert_eq!(remap.remap(ms(299)), ms(299));
        assert_eq!(remap.remap(ms(300)), ms(0));
        assert_eq!(remap.remap(ms(1000)), ms(100));
        assert_eq!(remap.iteration(ms(1000)), 3);
    }

    #[test]
    #[should_panic]
    fn remapper_rejects_empty_clip() {
        RepeatRemapper::new(Duration::ZERO);
    }

    #[test]
    fn read_mode_auto_threshold() {
        assert!(ReadMode::Auto.should_preload(Some(63)));
        assert!(!ReadMode::Auto.should_preload(Some(64)));
        assert!(!ReadMode::Auto.should_preload(None));
        assert!(ReadMode::Preload.should_preload(None));
        assert!(!ReadMode::Stream.should_preload(Some(1)));
    }

    #[test]
    fn source_enum_dispatches() {
        let mut source: FrameSource =
            PreloadedSource::new(frame_data(), vec![ms(10), ms(20)]).into();
        assert_eq!(source.frame_at(ms(12)).unwrap().layer, Some(1));
        source.seek(ms(0));
        assert_eq!(source.frame_at(ms(0)).unwrap().layer, Some(0));
    }
}
