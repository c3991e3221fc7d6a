use super::CaptureSource;
use crate::error::{Error, Result};
use image::{imageops, GrayImage, RgbImage};
use std::time::Instant;

/// One grayscale video frame. Immutable once sampled.
#[derive(Debug, Clone)]
pub struct GrayFrame {
    pub image: GrayImage,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl GrayFrame {
    pub fn new(image: GrayImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Result of sampling the video source once.
#[derive(Debug)]
pub enum Sample {
    /// Color frame for compositing plus its luminance for tracking.
    Ready { color: RgbImage, gray: GrayFrame },
    /// The source has no frame yet.
    NotReady,
}

/// Pulls frames from a capture source at the host's cadence.
#[derive(Debug, Default)]
pub struct FrameSampler {
    sequence: u64,
}

impl FrameSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames handed out so far.
    pub fn sampled(&self) -> u64 {
        self.sequence
    }

    /// Grabs the current frame. Only a failing device is an error.
    pub fn sample<C: CaptureSource + ?Sized>(&mut self, source: &mut C) -> Result<Sample> {
        let _span = tracing::debug_span!("sample").entered();

        let color = match source.capture_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Sample::NotReady),
            Err(e) => return Err(Error::DeviceUnavailable(format!("{e:#}"))),
        };
        if color.width() == 0 || color.height() == 0 {
            return Ok(Sample::NotReady);
        }

        let gray = GrayFrame::new(imageops::grayscale(&color), self.sequence);
        self.sequence += 1;
        Ok(Sample::Ready { color, gray })
    }
}
