use super::OutputSink;
use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Writes composited frames as numbered PNG files
pub struct PngSequence {
    dir: PathBuf,
    next: u64,
    width: u32,
    height: u32,
}

impl PngSequence {
    pub fn new<P: AsRef<Path>>(dir: P, width: u32, height: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        tracing::info!("Writing frames to {}", dir.display());
        Ok(Self {
            dir,
            next: 0,
            width,
            height,
        })
    }

    /// Number of frames written so far
    pub fn written(&self) -> u64 {
        self.next
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

impl OutputSink for PngSequence {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.frame_path(self.next);
        frame
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.next += 1;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_numbered_in_order() {
        let dir = std::env::temp_dir().join(format!("traceline-png-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut sink = PngSequence::new(&dir, 3, 2).unwrap();
        sink.write_frame(&RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3]))).unwrap();
        sink.write_frame(&RgbImage::from_pixel(3, 2, image::Rgb([4, 5, 6]))).unwrap();
        assert_eq!(sink.written(), 2);

        let second = image::open(dir.join("frame_000001.png")).unwrap().to_rgb8();
        assert_eq!(*second.get_pixel(2, 1), image::Rgb([4, 5, 6]));
        assert!(dir.join("frame_000000.png").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
