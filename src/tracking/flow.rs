//! Sparse pyramidal Lucas-Kanade optical flow.

use super::pyramid::{Level, Pyramid};
use super::{PointTrack, TrackStatus, TrackerBackend};
use crate::capture::GrayFrame;
use crate::geometry::{quad_lerp, ScreenPoint};

/// Lucas-Kanade parameters.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Patch half-size; the patch is (2r + 1)² pixels.
    pub window_radius: usize,
    /// Pyramid depth including full resolution.
    pub levels: usize,
    /// Gauss-Newton iterations per level.
    pub max_iterations: usize,
    /// Convergence threshold on the update step, in pixels.
    pub epsilon: f32,
    /// Smallest acceptable eigenvalue of the per-pixel structure tensor.
    pub min_eigenvalue: f32,
    /// Per-frame motion above this marks the point lost.
    pub max_displacement: f32,
    /// Interior seed grid is `grid × grid`; 0 seeds only the corners.
    pub grid: usize,
    /// Structure-tensor eigenvalue an interior seed needs to be kept.
    pub seed_quality: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_radius: 7,
            levels: 3,
            max_iterations: 20,
            epsilon: 0.01,
            min_eigenvalue: 1e-4,
            max_displacement: 80.0,
            grid: 4,
            seed_quality: 1.5e-4,
        }
    }
}

enum LevelResult {
    Converged(f32, f32),
    Singular,
}

/// Follows points between consecutive frames with pyramidal Lucas-Kanade.
#[derive(Debug, Clone, Default)]
pub struct OpticalFlowBackend {
    pub config: FlowConfig,
}

impl OpticalFlowBackend {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    /// Smaller eigenvalue of the patch structure tensor, per pixel.
    fn min_eigenvalue(&self, level: &Level, x: f32, y: f32) -> f32 {
        let r = self.config.window_radius as isize;
        let (mut g11, mut g12, mut g22) = (0.0f32, 0.0f32, 0.0f32);
        for wy in -r..=r {
            for wx in -r..=r {
                let (ix, iy) = level.gradient(x + wx as f32, y + wy as f32);
                g11 += ix * ix;
                g12 += ix * iy;
                g22 += iy * iy;
            }
        }
        let area = ((2 * r + 1) * (2 * r + 1)) as f32;
        smaller_eigenvalue(g11, g12, g22) / area
    }

    /// Iterative refinement at one level starting from displacement (dx, dy).
    fn refine_level(
        &self,
        prev: &Level,
        curr: &Level,
        x: f32,
        y: f32,
        mut dx: f32,
        mut dy: f32,
    ) -> LevelResult {
        let r = self.config.window_radius as isize;
        let side = (2 * r + 1) as usize;

        // Template values and gradients are fixed for the whole level.
        let mut template = Vec::with_capacity(side * side);
        let (mut g11, mut g12, mut g22) = (0.0f32, 0.0f32, 0.0f32);
        for wy in -r..=r {
            for wx in -r..=r {
                let (tx, ty) = (x + wx as f32, y + wy as f32);
                let value = prev.sample(tx, ty);
                let (ix, iy) = prev.gradient(tx, ty);
                g11 += ix * ix;
                g12 += ix * iy;
                g22 += iy * iy;
                template.push((value, ix, iy));
            }
        }

        let area = (side * side) as f32;
        let det = g11 * g22 - g12 * g12;
        let min_eig = smaller_eigenvalue(g11, g12, g22) / area;
        if det.abs() < f32::EPSILON || min_eig < self.config.min_eigenvalue {
            return LevelResult::Singular;
        }
        let inv_det = 1.0 / det;

        for _ in 0..self.config.max_iterations {
            let (mut b1, mut b2) = (0.0f32, 0.0f32);
            let mut k = 0;
            for wy in -r..=r {
                for wx in -r..=r {
                    let (t, ix, iy) = template[k];
                    k += 1;
                    let e = t - curr.sample(x + dx + wx as f32, y + dy + wy as f32);
                    b1 += ix * e;
                    b2 += iy * e;
                }
            }
            let step_x = inv_det * (g22 * b1 - g12 * b2);
            let step_y = inv_det * (g11 * b2 - g12 * b1);
            if !step_x.is_finite() || !step_y.is_finite() {
                return LevelResult::Singular;
            }
            dx += step_x;
            dy += step_y;
            if step_x * step_x + step_y * step_y < self.config.epsilon * self.config.epsilon {
                break;
            }
        }
        LevelResult::Converged(dx, dy)
    }

    fn track_point(&self, prev: &Pyramid, curr: &Pyramid, point: ScreenPoint) -> PointTrack {
        let levels = prev.num_levels().min(curr.num_levels());
        let (px, py) = (point.x as f32, point.y as f32);
        let (mut dx, mut dy) = (0.0f32, 0.0f32);

        for level in (0..levels).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            match self.refine_level(
                &prev.levels[level],
                &curr.levels[level],
                px * scale,
                py * scale,
                dx,
                dy,
            ) {
                LevelResult::Converged(ndx, ndy) => {
                    dx = ndx;
                    dy = ndy;
                }
                LevelResult::Singular => return PointTrack::lost(point),
            }
            if level > 0 {
                dx *= 2.0;
                dy *= 2.0;
            }
        }

        let moved = ScreenPoint::new(point.x + dx as f64, point.y + dy as f64);
        let base = &curr.levels[0];
        let status = classify(
            moved,
            (dx * dx + dy * dy).sqrt(),
            (base.width(), base.height()),
            self.config.max_displacement,
        );
        PointTrack {
            position: moved,
            status,
        }
    }
}

/// Smaller eigenvalue of the symmetric 2×2 matrix [[g11, g12], [g12, g22]].
fn smaller_eigenvalue(g11: f32, g12: f32, g22: f32) -> f32 {
    0.5 * ((g11 + g22) - ((g11 - g22).powi(2) + 4.0 * g12 * g12).sqrt())
}

fn classify(
    moved: ScreenPoint,
    displacement: f32,
    dims: (usize, usize),
    max_displacement: f32,
) -> TrackStatus {
    if !displacement.is_finite() || displacement > max_displacement {
        return TrackStatus::Lost;
    }
    let (w, h) = (dims.0 as f64, dims.1 as f64);
    if moved.x < 0.0 || moved.y < 0.0 || moved.x >= w || moved.y >= h {
        return TrackStatus::OutOfBounds;
    }
    TrackStatus::Tracked
}

impl TrackerBackend for OpticalFlowBackend {
    fn name(&self) -> &'static str {
        "optical-flow"
    }

    fn seed(&mut self, frame: &GrayFrame, corners: &[ScreenPoint; 4]) -> Vec<ScreenPoint> {
        let mut seeds = corners.to_vec();
        let grid = self.config.grid;
        if grid == 0 {
            return seeds;
        }

        let level = Level::from_gray(&frame.image);
        for gy in 0..grid {
            for gx in 0..grid {
                let u = (gx as f64 + 0.5) / grid as f64;
                let v = (gy as f64 + 0.5) / grid as f64;
                let p = quad_lerp(corners, u, v);
                if self.min_eigenvalue(&level, p.x as f32, p.y as f32) >= self.config.seed_quality {
                    seeds.push(p);
                }
            }
        }
        tracing::debug!("Seeded {} interior points", seeds.len() - corners.len());
        seeds
    }

    fn track(
        &mut self,
        prev: &GrayFrame,
        curr: &GrayFrame,
        points: &[ScreenPoint],
    ) -> Vec<PointTrack> {
        let _span = tracing::debug_span!("optical_flow", points = points.len()).entered();
        let prev_pyr = Pyramid::build(&prev.image, self.config.levels);
        let curr_pyr = Pyramid::build(&curr.image, self.config.levels);
        points
            .iter()
            .map(|p| self.track_point(&prev_pyr, &curr_pyr, *p))
            .collect()
    }
}
