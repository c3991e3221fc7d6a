//! Projective transform estimation between two planar point sets.
//!
//! Direct Linear Transform with Hartley normalization, wrapped in RANSAC
//! when more than the minimal four correspondences are available.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::geometry::{check_configuration, ScreenPoint};

/// Smallest correspondence count a homography can be solved from.
pub const MIN_CORRESPONDENCES: usize = 4;

const NORMALIZE_EPS: f64 = 1e-12;

/// A 3×3 projective transform normalized so the bottom-right entry is 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    m: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            m: Matrix3::identity(),
        }
    }

    /// Normalizes `m` so `m[(2, 2)] == 1`.
    ///
    /// Fails when the matrix has non-finite entries, cannot be normalized,
    /// or is singular.
    pub fn from_matrix(m: Matrix3<f64>) -> Result<Self> {
        if m.iter().any(|v| !v.is_finite()) {
            return Err(Error::HomographySolveFailed("non-finite entries".into()));
        }
        let scale = m[(2, 2)];
        if scale.abs() < NORMALIZE_EPS {
            return Err(Error::HomographySolveFailed(
                "bottom-right entry is zero, cannot normalize".into(),
            ));
        }
        let m = m / scale;
        if m.determinant().abs() < NORMALIZE_EPS {
            return Err(Error::HomographySolveFailed("matrix is singular".into()));
        }
        Ok(Self { m })
    }

    /// Builds from nine row-major entries.
    pub fn from_row_major(h: [f64; 9]) -> Result<Self> {
        Self::from_matrix(Matrix3::from_row_slice(&h))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.m
    }

    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.m;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    /// Maps `p` through the transform. `None` if it lands on the line at
    /// infinity.
    pub fn project(&self, p: ScreenPoint) -> Option<ScreenPoint> {
        let v = self.m * Vector3::new(p.x, p.y, 1.0);
        if v[2].abs() < NORMALIZE_EPS {
            return None;
        }
        Some(ScreenPoint::new(v[0] / v[2], v[1] / v[2]))
    }

    pub fn inverse(&self) -> Result<Self> {
        let inv = self
            .m
            .try_inverse()
            .ok_or_else(|| Error::HomographySolveFailed("matrix is not invertible".into()))?;
        Self::from_matrix(inv)
    }

    /// The transform that applies `self` first, then `next`.
    pub fn then(&self, next: &Homography) -> Result<Self> {
        Self::from_matrix(next.m * self.m)
    }

    /// Euclidean distance between `project(src)` and `dst`; infinite when
    /// the projection is undefined.
    pub fn reprojection_error(&self, src: ScreenPoint, dst: ScreenPoint) -> f64 {
        self.project(src)
            .map(|p| p.distance(&dst))
            .unwrap_or(f64::INFINITY)
    }
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

/// RANSAC configuration for homography fitting.
#[derive(Debug, Clone)]
pub struct RansacConfig {
    /// Upper bound on sampled hypotheses.
    pub max_iters: usize,
    /// Inlier threshold on reprojection error, in pixels.
    pub inlier_threshold: f64,
    /// Probability of drawing at least one outlier-free sample; drives
    /// early termination.
    pub confidence: f64,
    /// Minimum inliers for the fit to be accepted.
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 3.0,
            confidence: 0.995,
            min_inliers: MIN_CORRESPONDENCES,
            seed: 0,
        }
    }
}

/// Result of a robust homography fit.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub homography: Homography,
    /// One flag per correspondence; true for inliers.
    pub inliers: Vec<bool>,
    pub n_inliers: usize,
    /// Mean reprojection error over inliers, in pixels.
    pub mean_error: f64,
}

/// Fits the homography mapping `src` onto `dst`.
///
/// Exactly four pairs are solved directly. Larger sets go through RANSAC
/// followed by a least-squares refit on the inliers.
pub fn estimate(
    src: &[ScreenPoint],
    dst: &[ScreenPoint],
    config: &RansacConfig,
) -> Result<Estimate> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES || src.len() != dst.len() {
        return Err(Error::InsufficientCorrespondences {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }

    let strict = n == MIN_CORRESPONDENCES;
    check_configuration(src, strict)?;
    check_configuration(dst, strict)?;

    let h = if n == MIN_CORRESPONDENCES {
        solve_dlt(src, dst)?
    } else {
        ransac(src, dst, config)?
    };

    let (inliers, n_inliers, mean_error) = score(&h, src, dst, config.inlier_threshold);
    if n_inliers < config.min_inliers.max(MIN_CORRESPONDENCES) {
        return Err(Error::HomographySolveFailed(format!(
            "only {n_inliers} of {n} correspondences are inliers"
        )));
    }

    tracing::trace!(n, n_inliers, mean_error, "homography estimated");

    Ok(Estimate {
        homography: h,
        inliers,
        n_inliers,
        mean_error,
    })
}

fn score(
    h: &Homography,
    src: &[ScreenPoint],
    dst: &[ScreenPoint],
    threshold: f64,
) -> (Vec<bool>, usize, f64) {
    let mut mask = Vec::with_capacity(src.len());
    let mut count = 0usize;
    let mut total = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let err = h.reprojection_error(*s, *d);
        let inlier = err < threshold;
        if inlier {
            count += 1;
            total += err;
        }
        mask.push(inlier);
    }
    let mean = if count > 0 { total / count as f64 } else { f64::INFINITY };
    (mask, count, mean)
}

/// Iterations needed to hit `confidence` given the current inlier ratio.
fn adaptive_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    let p_good = inlier_ratio.powi(MIN_CORRESPONDENCES as i32);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return cap;
    }
    let k = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if !k.is_finite() {
        return cap;
    }
    (k.ceil() as usize).clamp(1, cap)
}

fn ransac(src: &[ScreenPoint], dst: &[ScreenPoint], config: &RansacConfig) -> Result<Homography> {
    let n = src.len();
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut best: Option<(Homography, usize)> = None;
    let mut budget = config.max_iters.max(1);
    let mut iter = 0usize;

    while iter < budget {
        iter += 1;

        let picks = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES);
        let s: Vec<ScreenPoint> = picks.iter().map(|i| src[i]).collect();
        let d: Vec<ScreenPoint> = picks.iter().map(|i| dst[i]).collect();
        if check_configuration(&s, true).is_err() || check_configuration(&d, true).is_err() {
            continue;
        }
        let Ok(h) = solve_dlt(&s, &d) else {
            continue;
        };

        let (_, count, _) = score(&h, src, dst, config.inlier_threshold);
        if best.as_ref().map_or(true, |(_, c)| count > *c) {
            best = Some((h, count));
            let ratio = count as f64 / n as f64;
            budget = adaptive_iterations(ratio, config.confidence, config.max_iters).max(iter);
        }
    }

    let Some((best_h, best_count)) = best else {
        return Err(Error::HomographySolveFailed(
            "no non-degenerate minimal sample".into(),
        ));
    };
    tracing::trace!(iterations = iter, best_count, "ransac finished");

    let (mask, _, _) = score(&best_h, src, dst, config.inlier_threshold);
    let keep = |pts: &[ScreenPoint]| -> Vec<ScreenPoint> {
        pts.iter().zip(&mask).filter(|(_, m)| **m).map(|(p, _)| *p).collect()
    };
    let (in_src, in_dst) = (keep(src), keep(dst));
    if in_src.len() < MIN_CORRESPONDENCES {
        return Ok(best_h);
    }
    Ok(solve_dlt(&in_src, &in_dst).unwrap_or(best_h))
}

/// Translates the centroid to the origin and scales the mean distance to
/// sqrt(2).
fn normalizing_transform(pts: &[ScreenPoint]) -> Result<(Matrix3<f64>, Vec<ScreenPoint>)> {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < NORMALIZE_EPS {
        return Err(Error::DegenerateGeometry("all points coincide".into()));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| ScreenPoint::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Ok((t, normalized))
}

/// Least-squares DLT over all given pairs.
pub fn solve_dlt(src: &[ScreenPoint], dst: &[ScreenPoint]) -> Result<Homography> {
    let n = src.len();
    if n < MIN_CORRESPONDENCES || dst.len() != n {
        return Err(Error::InsufficientCorrespondences {
            needed: MIN_CORRESPONDENCES,
            got: n.min(dst.len()),
        });
    }

    let (t_src, src_n) = normalizing_transform(src)?;
    let (t_dst, dst_n) = normalizing_transform(dst)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        let r = 2 * i;
        a[(r, 3)] = -s.x;
        a[(r, 4)] = -s.y;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = d.y * s.x;
        a[(r, 7)] = d.y * s.y;
        a[(r, 8)] = d.y;

        a[(r + 1, 0)] = s.x;
        a[(r + 1, 1)] = s.y;
        a[(r + 1, 2)] = 1.0;
        a[(r + 1, 6)] = -d.x * s.x;
        a[(r + 1, 7)] = -d.x * s.y;
        a[(r + 1, 8)] = -d.x;
    }

    // Null vector of A is the eigenvector of AᵀA with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| x.abs().total_cmp(&y.abs()))
        .ok_or_else(|| Error::HomographySolveFailed("empty eigen decomposition".into()))?;
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::HomographySolveFailed("normalizer not invertible".into()))?;
    Homography::from_matrix(t_dst_inv * h_norm * t_src)
}
