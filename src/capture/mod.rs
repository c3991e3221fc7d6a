mod replay;
mod sampler;
mod webcam;

pub use replay::ReplayCapture;
pub use sampler::{FrameSampler, GrayFrame, Sample};
pub use webcam::{CameraConfig, FacingMode, WebcamCapture};

use anyhow::Result;
use image::RgbImage;

/// Trait for video frame sources
pub trait CaptureSource {
    /// Capture the current frame, or `None` while the source has nothing
    /// to deliver yet
    fn capture_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Native resolution of delivered frames
    fn resolution(&self) -> (u32, u32);

    /// Stop streaming and release the underlying device
    fn release(&mut self) -> Result<()>;

    /// Number of device streams currently held open
    fn active_tracks(&self) -> usize;
}
