use super::OutputSink;
use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Publishes composited frames on a v4l2loopback device as YUYV
pub struct V4L2Output {
    _device: Device,
    file: File,
    width: u32,
    height: u32,
    scratch: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let actual = Output::set_format(&device, &requested)
            .context("Failed to set loopback output format")?;
        if actual.width != width || actual.height != height {
            tracing::warn!(
                "Loopback negotiated {}x{} instead of {}x{}",
                actual.width,
                actual.height,
                width,
                height
            );
        }

        // Frames go through plain writes on the device node
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;

        tracing::info!("v4l2loopback device ready");

        Ok(Self {
            _device: device,
            file,
            width: actual.width,
            height: actual.height,
            scratch: Vec::new(),
        })
    }
}

/// BT.601 studio-range luma and chroma from 8-bit RGB
fn yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Packs RGB into YUYV (Y0 U Y1 V), sharing chroma across pixel pairs
fn pack_yuyv(frame: &RgbImage, out: &mut Vec<u8>) {
    let row_len = frame.width() as usize * 3;
    out.clear();
    if row_len == 0 {
        return;
    }
    out.reserve(frame.as_raw().len() / 3 * 2 + 4);

    for row in frame.as_raw().chunks_exact(row_len) {
        for pair in row.chunks(6) {
            // Odd widths repeat the last pixel.
            let (a, b) = if pair.len() == 6 { pair.split_at(3) } else { (pair, pair) };
            let (y0, u0, v0) = yuv(a[0], a[1], a[2]);
            let (y1, u1, v1) = yuv(b[0], b[1], b[2]);
            out.extend_from_slice(&[
                y0,
                ((u0 as u16 + u1 as u16) / 2) as u8,
                y1,
                ((v0 as u16 + v1 as u16) / 2) as u8,
            ]);
        }
    }
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let _span = tracing::debug_span!("loopback_write").entered();

        let resized;
        let frame = if frame.dimensions() != (self.width, self.height) {
            resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        pack_yuyv(frame, &mut self.scratch);
        self.file
            .write_all(&self.scratch)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn black_and_white_map_to_studio_range() {
        assert_eq!(yuv(0, 0, 0), (16, 128, 128));
        assert_eq!(yuv(255, 255, 255), (235, 128, 128));
    }

    #[test]
    fn yuyv_is_two_bytes_per_pixel() {
        let frame = RgbImage::from_pixel(5, 2, Rgb([255, 255, 255]));
        let mut out = Vec::new();
        pack_yuyv(&frame, &mut out);
        assert_eq!(out.len(), 3 * 4 * 2);
        assert_eq!(&out[..4], &[235, 128, 235, 128]);
    }

    #[test]
    fn pairs_share_averaged_chroma() {
        let mut frame = RgbImage::new(2, 1);
        frame.put_pixel(0, 0, Rgb([255, 0, 0]));
        frame.put_pixel(1, 0, Rgb([0, 0, 255]));
        let mut out = Vec::new();
        pack_yuyv(&frame, &mut out);

        let (yr, ur, vr) = yuv(255, 0, 0);
        let (yb, ub, vb) = yuv(0, 0, 255);
        let avg = |a: u8, b: u8| ((a as u16 + b as u16) / 2) as u8;
        assert_eq!(out, vec![yr, avg(ur, ub), yb, avg(vr, vb)]);
    }
}
