//! Places the reference image over the video frame.

use std::path::Path;

use image::{Rgba, RgbImage, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::Matrix3;

use crate::error::{Error, Result};
use crate::geometry::ScreenPoint;
use crate::homography::Homography;

pub const DEFAULT_OPACITY: f32 = 0.5;

/// The user's tracing reference.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub image: RgbaImage,
}

impl ReferenceImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgba8();
        tracing::info!(
            "Loaded reference {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self { image })
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

pub fn reference_corners((w, h): (u32, u32)) -> [ScreenPoint; 4] {
    let (w, h) = (w as f64, h as f64);
    [
        ScreenPoint::new(0.0, 0.0),
        ScreenPoint::new(w, 0.0),
        ScreenPoint::new(w, h),
        ScreenPoint::new(0.0, h),
    ]
}

/// How the reference is placed. The two modes never apply together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverlayMode {
    /// Fitted to the frame and rotated by the slider.
    Manual { rotation_deg: f64 },
    /// Locked to the tracked surface.
    Tracked(Homography),
}

/// Opacity and placement read by the renderer each cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayState {
    opacity: f32,
    rotation_deg: f64,
    homography: Option<Homography>,
}

impl Default for OverlayState {
    fn default() -> Self {
        Self::new(DEFAULT_OPACITY)
    }
}

impl OverlayState {
    pub fn new(opacity: f32) -> Self {
        Self {
            opacity: opacity.clamp(0.0, 1.0),
            rotation_deg: 0.0,
            homography: None,
        }
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { DEFAULT_OPACITY } else { opacity.clamp(0.0, 1.0) };
    }

    /// Sets the manual rotation. Ignored while tracking; returns whether
    /// it took effect.
    pub fn set_rotation(&mut self, degrees: f64) -> bool {
        if self.homography.is_some() {
            return false;
        }
        self.rotation_deg = degrees.rem_euclid(360.0);
        true
    }

    pub fn mode(&self) -> OverlayMode {
        match self.homography {
            Some(h) => OverlayMode::Tracked(h),
            None => OverlayMode::Manual {
                rotation_deg: self.rotation_deg,
            },
        }
    }

    pub fn homography(&self) -> Option<&Homography> {
        self.homography.as_ref()
    }

    /// Replaces the tracked transform as a whole.
    pub fn publish(&mut self, homography: Homography) {
        self.homography = Some(homography);
    }

    /// Returns to manual placement.
    pub fn release_tracking(&mut self) {
        self.homography = None;
    }
}

/// Final placement of the reference in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayTransform {
    pub matrix: Homography,
    pub opacity: f32,
}

impl OverlayTransform {
    /// CSS `matrix3d(...)` for an element with `transform-origin: 0 0`.
    pub fn css_matrix3d(&self) -> String {
        let h = self.matrix.to_row_major();
        let columns = [
            h[0], h[3], 0.0, h[6], //
            h[1], h[4], 0.0, h[7], //
            0.0, 0.0, 1.0, 0.0, //
            h[2], h[5], 0.0, h[8],
        ];
        let body: Vec<String> = columns.iter().map(|v| format!("{v}")).collect();
        format!("matrix3d({})", body.join(", "))
    }
}

/// Stateless: everything it needs is passed in.
pub struct OverlayRenderer;

impl OverlayRenderer {
    pub fn transform(
        reference_dims: (u32, u32),
        frame_dims: (u32, u32),
        state: &OverlayState,
    ) -> Result<OverlayTransform> {
        let matrix = match state.mode() {
            OverlayMode::Tracked(h) => h,
            OverlayMode::Manual { rotation_deg } => {
                manual_placement(reference_dims, frame_dims, rotation_deg)?
            }
        };
        Ok(OverlayTransform {
            matrix,
            opacity: state.opacity(),
        })
    }

    /// Draws `reference` over `frame` with the given placement.
    pub fn composite(
        frame: &RgbImage,
        reference: &RgbaImage,
        transform: &OverlayTransform,
    ) -> RgbImage {
        let _span = tracing::debug_span!("composite").entered();
        let mut out = frame.clone();
        if transform.opacity <= 0.0 {
            return out;
        }

        let h = transform.matrix.to_row_major().map(|v| v as f32);
        let Some(projection) = Projection::from_matrix(h) else {
            tracing::warn!("Overlay transform is not invertible, skipping draw");
            return out;
        };

        let (w, hgt) = frame.dimensions();
        let mut warped = RgbaImage::new(w, hgt);
        warp_into(
            reference,
            &projection,
            Interpolation::Bilinear,
            Rgba([0, 0, 0, 0]),
            &mut warped,
        );

        for (dst, src) in out.pixels_mut().zip(warped.pixels()) {
            let alpha = transform.opacity * src[3] as f32 / 255.0;
            if alpha <= 0.0 {
                continue;
            }
            for c in 0..3 {
                let blended = dst[c] as f32 * (1.0 - alpha) + src[c] as f32 * alpha;
                dst[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

/// Fits the reference inside the frame, keeping its aspect ratio, then
/// rotates it about the frame centre.
fn manual_placement(
    reference_dims: (u32, u32),
    frame_dims: (u32, u32),
    rotation_deg: f64,
) -> Result<Homography> {
    let (rw, rh) = (reference_dims.0 as f64, reference_dims.1 as f64);
    let (fw, fh) = (frame_dims.0 as f64, frame_dims.1 as f64);
    if rw <= 0.0 || rh <= 0.0 || fw <= 0.0 || fh <= 0.0 {
        return Err(Error::HomographySolveFailed(format!(
            "cannot place {}x{} reference in {}x{} frame",
            reference_dims.0, reference_dims.1, frame_dims.0, frame_dims.1
        )));
    }

    let s = (fw / rw).min(fh / rh);
    let fit = Matrix3::new(s, 0.0, (fw - rw * s) / 2.0, 0.0, s, (fh - rh * s) / 2.0, 0.0, 0.0, 1.0);

    let (cx, cy) = (fw / 2.0, fh / 2.0);
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    let rotate = Matrix3::new(
        cos,
        -sin,
        cx - cos * cx + sin * cy,
        sin,
        cos,
        cy - sin * cx - cos * cy,
        0.0,
        0.0,
        1.0,
    );
    Homography::from_matrix(rotate * fit)
}
