mod loopback;
mod png_sequence;

pub use loopback::V4L2Output;
pub use png_sequence::PngSequence;

use anyhow::Result;
use image::RgbImage;

/// Trait for composited frame destinations
pub trait OutputSink {
    /// Write a frame to the output
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
