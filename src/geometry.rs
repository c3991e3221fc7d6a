//! Screen-space points and the degeneracy tests shared by the point
//! collector and the homography estimator.

use crate::error::{Error, Result};

/// A 2D coordinate in video pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &ScreenPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<[f64; 2]> for ScreenPoint {
    fn from(p: [f64; 2]) -> Self {
        Self::new(p[0], p[1])
    }
}

/// Twice the signed area of triangle (a, b, c).
fn cross(a: &ScreenPoint, b: &ScreenPoint, c: &ScreenPoint) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Squared diagonal of the bounding box, used to scale tolerances.
fn extent_sq(points: &[ScreenPoint]) -> f64 {
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    (max_x - min_x).powi(2) + (max_y - min_y).powi(2)
}

const DUPLICATE_EPS: f64 = 1e-9;
const COLLINEAR_EPS: f64 = 1e-6;

fn collinear(a: &ScreenPoint, b: &ScreenPoint, c: &ScreenPoint, scale_sq: f64) -> bool {
    cross(a, b, c).abs() <= COLLINEAR_EPS * scale_sq
}

/// Rejects point sets no projective transform can be fitted to.
///
/// Always rejects coincident points and sets that lie on a single line.
/// With `strict` (used for minimal four-point sets) any collinear triple
/// is rejected as well.
pub fn check_configuration(points: &[ScreenPoint], strict: bool) -> Result<()> {
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(Error::DegenerateGeometry("non-finite coordinate".into()));
    }

    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            if a.distance(b) <= DUPLICATE_EPS {
                return Err(Error::DegenerateGeometry(format!(
                    "duplicate point at ({:.2}, {:.2})",
                    a.x, a.y
                )));
            }
        }
    }

    let scale_sq = extent_sq(points);
    if points.len() < 3 {
        return Ok(());
    }

    if strict {
        for i in 0..points.len() {
            for j in (i + 1)..points.len() {
                for k in (j + 1)..points.len() {
                    if collinear(&points[i], &points[j], &points[k], scale_sq) {
                        return Err(Error::DegenerateGeometry(format!(
                            "points {i}, {j} and {k} are collinear"
                        )));
                    }
                }
            }
        }
        return Ok(());
    }

    // Non-strict: degenerate only if every point lies on the line through
    // the two points farthest apart.
    let (mut ia, mut ib, mut best) = (0, 1, 0.0);
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let d = points[i].distance(&points[j]);
            if d > best {
                best = d;
                ia = i;
                ib = j;
            }
        }
    }
    let all_on_line = points
        .iter()
        .all(|p| collinear(&points[ia], &points[ib], p, scale_sq));
    if all_on_line {
        return Err(Error::DegenerateGeometry("all points are collinear".into()));
    }
    Ok(())
}

/// Bilinear interpolation inside the quad `corners` (TL, TR, BR, BL) at
/// normalized coordinates (u, v).
pub fn quad_lerp(corners: &[ScreenPoint; 4], u: f64, v: f64) -> ScreenPoint {
    let top = ScreenPoint::new(
        corners[0].x + (corners[1].x - corners[0].x) * u,
        corners[0].y + (corners[1].y - corners[0].y) * u,
    );
    let bottom = ScreenPoint::new(
        corners[3].x + (corners[2].x - corners[3].x) * u,
        corners[3].y + (corners[2].y - corners[3].y) * u,
    );
    ScreenPoint::new(
        top.x + (bottom.x - top.x) * v,
        top.y + (bottom.y - top.y) * v,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<ScreenPoint> {
        vec![
            ScreenPoint::new(10.0, 10.0),
            ScreenPoint::new(100.0, 10.0),
            ScreenPoint::new(100.0, 100.0),
            ScreenPoint::new(10.0, 100.0),
        ]
    }

    #[test]
    fn square_is_valid() {
        assert!(check_configuration(&square(), true).is_ok());
    }

    #[test]
    fn duplicate_rejected() {
        let mut pts = square();
        pts[3] = pts[1];
        assert!(matches!(
            check_configuration(&pts, false),
            Err(Error::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn three_collinear_only_rejected_when_strict() {
        let pts = vec![
            ScreenPoint::new(0.0, 0.0),
            ScreenPoint::new(50.0, 0.0),
            ScreenPoint::new(100.0, 0.0),
            ScreenPoint::new(50.0, 80.0),
        ];
        assert!(check_configuration(&pts, true).is_err());
        assert!(check_configuration(&pts, false).is_ok());
    }

    #[test]
    fn all_collinear_rejected() {
        let pts: Vec<_> = (0..6)
            .map(|i| ScreenPoint::new(i as f64 * 10.0, i as f64 * 5.0 + 3.0))
            .collect();
        assert!(check_configuration(&pts, false).is_err());
    }

    #[test]
    fn quad_lerp_hits_corners() {
        let q = [
            ScreenPoint::new(0.0, 0.0),
            ScreenPoint::new(10.0, 0.0),
            ScreenPoint::new(12.0, 8.0),
            ScreenPoint::new(-2.0, 8.0),
        ];
        assert_eq!(quad_lerp(&q, 1.0, 1.0), q[2]);
        assert_eq!(quad_lerp(&q, 0.0, 1.0), q[3]);
        let mid = quad_lerp(&q, 0.5, 0.5);
        assert!((mid.x - 5.0).abs() < 1e-12 && (mid.y - 4.0).abs() < 1e-12);
    }
}
