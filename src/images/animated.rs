//! Decoded animated images.

use std::io::Cursor;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, Frame, ImageDecoder, ImageResult};

/// A fully decoded animation: every frame is held in memory.
///
/// Consumers drive playback themselves; this type only carries the frames,
/// the canvas dimensions, and the summed frame delays.
pub struct AnimatedImage {
    frames: Vec<Frame>,
    width: u32,
    height: u32,
}

impl AnimatedImage {
    /// Decode a GIF byte stream into its full frame sequence.
    pub(crate) fn decode(bytes: &[u8]) -> ImageResult<Self> {
        let decoder = GifDecoder::new(Cursor::new(bytes))?;
        let (width, height) = decoder.dimensions();
        let frames = decoder.into_frames().collect_frames()?;
        Ok(Self {
            frames,
            width,
            height,
        })
    }

    /// Canvas width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Canvas height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Decoded frames in presentation order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total duration of one playback pass.
    pub fn duration(&self) -> Duration {
        self.frames
            .iter()
            .map(|frame| Duration::from(frame.delay()))
            .sum()
    }

    /// Estimated bytes held by the decoded frames (RGBA).
    pub(crate) fn byte_estimate(&self) -> u64 {
        self.frames
            .iter()
            .map(|frame| u64::from(frame.buffer().width()) * u64::from(frame.buffer().height()) * 4)
            .sum()
    }
}
