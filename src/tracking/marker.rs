//! Fiducial tracking: the marker's corners are located from scratch in
//! every frame instead of being followed by flow.

use std::collections::HashMap;

use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::{PointTrack, TrackerBackend};
use crate::capture::GrayFrame;
use crate::geometry::ScreenPoint;

/// Finds a four-cornered marker in a grayscale frame.
pub trait MarkerLocator {
    /// Marker corners, clockwise from top-left, if the marker is visible.
    fn locate(&mut self, frame: &GrayImage) -> Option<[ScreenPoint; 4]>;
}

/// Locates the largest dark blob and takes its extreme points as corners.
///
/// Suited to a solid dark square on light paper held within about 40° of
/// upright.
#[derive(Debug, Clone)]
pub struct DarkQuadLocator {
    /// Fixed binarization level; Otsu's level when `None`.
    pub threshold: Option<u8>,
    /// Smallest blob, in pixels, accepted as the marker.
    pub min_area: u32,
    /// Largest share of the frame a blob may cover.
    pub max_coverage: f32,
}

impl Default for DarkQuadLocator {
    fn default() -> Self {
        Self {
            threshold: None,
            min_area: 64,
            max_coverage: 0.9,
        }
    }
}

impl MarkerLocator for DarkQuadLocator {
    fn locate(&mut self, frame: &GrayImage) -> Option<[ScreenPoint; 4]> {
        let (w, h) = frame.dimensions();
        let level = self.threshold.unwrap_or_else(|| otsu_level(frame));
        // Otsu's level is the top of the dark class.
        let mask = GrayImage::from_fn(w, h, |x, y| {
            Luma([if frame.get_pixel(x, y)[0] <= level { 255 } else { 0 }])
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut areas: HashMap<u32, u32> = HashMap::new();
        for p in labels.pixels() {
            if p[0] != 0 {
                *areas.entry(p[0]).or_default() += 1;
            }
        }
        let (label, area) = areas
            .into_iter()
            .max_by_key(|&(label, area)| (area, u32::MAX - label))?;
        if area < self.min_area || area as f32 > self.max_coverage * (w * h) as f32 {
            return None;
        }

        // Extremes of x + y and x - y pick out the four corners.
        let mut tl = (i64::MAX, 0, 0);
        let mut tr = (i64::MIN, 0, 0);
        let mut br = (i64::MIN, 0, 0);
        let mut bl = (i64::MAX, 0, 0);
        for (x, y, p) in labels.enumerate_pixels() {
            if p[0] != label {
                continue;
            }
            let (xi, yi) = (x as i64, y as i64);
            let (sum, diff) = (xi + yi, xi - yi);
            if sum < tl.0 {
                tl = (sum, x, y);
            }
            if sum > br.0 {
                br = (sum, x, y);
            }
            if diff > tr.0 {
                tr = (diff, x, y);
            }
            if diff < bl.0 {
                bl = (diff, x, y);
            }
        }

        let corner = |c: (i64, u32, u32)| ScreenPoint::new(c.1 as f64, c.2 as f64);
        Some([corner(tl), corner(tr), corner(br), corner(bl)])
    }
}

/// Tracks by re-locating a fiducial marker each frame.
///
/// The user's corners are expected to sit on the marker's corners; only
/// those four points are followed.
#[derive(Debug, Clone, Default)]
pub struct MarkerBackend<L: MarkerLocator> {
    locator: L,
}

impl<L: MarkerLocator> MarkerBackend<L> {
    pub fn new(locator: L) -> Self {
        Self { locator }
    }
}

/// Cyclic shift of `found` that moves the corners the least from `prev`.
fn best_rotation(prev: &[ScreenPoint], found: &[ScreenPoint; 4]) -> usize {
    (0..4)
        .map(|shift| {
            let cost: f64 = prev
                .iter()
                .enumerate()
                .map(|(i, p)| p.distance(&found[(i + shift) % 4]))
                .sum();
            (shift, cost)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(shift, _)| shift)
}

impl<L: MarkerLocator> TrackerBackend for MarkerBackend<L> {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn seed(&mut self, _frame: &GrayFrame, corners: &[ScreenPoint; 4]) -> Vec<ScreenPoint> {
        corners.to_vec()
    }

    fn track(
        &mut self,
        _prev: &GrayFrame,
        curr: &GrayFrame,
        points: &[ScreenPoint],
    ) -> Vec<PointTrack> {
        let _span = tracing::debug_span!("marker_locate").entered();

        let located = if points.len() >= 4 {
            self.locator.locate(&curr.image)
        } else {
            None
        };
        let Some(found) = located else {
            tracing::debug!("Marker not found in frame {}", curr.sequence);
            return points.iter().map(|p| PointTrack::lost(*p)).collect();
        };

        let shift = best_rotation(&points[..4], &found);
        points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i < 4 {
                    PointTrack::tracked(found[(i + shift) % 4])
                } else {
                    PointTrack::lost(*p)
                }
            })
            .collect()
    }
}
