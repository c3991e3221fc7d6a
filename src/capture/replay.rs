use super::CaptureSource;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Plays a directory of still images as a video source
pub struct ReplayCapture {
    frames: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
    open: bool,
    width: u32,
    height: u32,
}

impl ReplayCapture {
    pub fn new<P: AsRef<Path>>(dir: P, looping: bool) -> Result<Self> {
        let dir = dir.as_ref();
        tracing::info!("Opening replay directory {}", dir.display());

        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read replay directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        frames.sort();

        let Some(first) = frames.first() else {
            bail!("No image frames in {}", dir.display());
        };
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("Failed to read {}", first.display()))?;

        tracing::info!("Replay has {} frames at {}x{}", frames.len(), width, height);

        Ok(Self {
            frames,
            cursor: 0,
            looping,
            open: true,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl CaptureSource for ReplayCapture {
    fn capture_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.open {
            return Ok(None);
        }
        if self.cursor >= self.frames.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let path = &self.frames[self.cursor];
        self.cursor += 1;
        let frame = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();
        Ok(Some(frame))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("traceline-replay-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plays_frames_in_name_order() {
        let dir = scratch_dir("order");
        RgbImage::from_pixel(4, 3, image::Rgb([200, 0, 0])).save(dir.join("b.png")).unwrap();
        RgbImage::from_pixel(4, 3, image::Rgb([0, 0, 200])).save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let mut replay = ReplayCapture::new(&dir, false).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay.resolution(), (4, 3));

        let first = replay.capture_frame().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0)[2], 200);
        let second = replay.capture_frame().unwrap().unwrap();
        assert_eq!(second.get_pixel(0, 0)[0], 200);
        assert!(replay.capture_frame().unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn release_closes_the_stream() {
        let dir = scratch_dir("release");
        RgbImage::new(2, 2).save(dir.join("0.png")).unwrap();

        let mut replay = ReplayCapture::new(&dir, true).unwrap();
        assert_eq!(replay.active_tracks(), 1);
        replay.release().unwrap();
        assert_eq!(replay.active_tracks(), 0);
        assert!(replay.capture_frame().unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = scratch_dir("empty");
        assert!(ReplayCapture::new(&dir, false).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
