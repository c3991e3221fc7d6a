//! Four-corner picker for the physical drawing surface.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use crate::error::Result;
use crate::geometry::{check_configuration, ScreenPoint};

pub const CORNER_COUNT: usize = 4;

const MARKER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MARKER_RADIUS: i32 = 5;

/// What a click did to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    /// Point stored; carries how many are held now.
    Recorded(usize),
    /// Fourth point stored and the set validated.
    Completed([ScreenPoint; CORNER_COUNT]),
    /// Not selecting, or already full.
    Ignored,
}

/// Collects the four corners in click order and maps them from display
/// coordinates into the video's native resolution.
#[derive(Debug, Clone)]
pub struct PointCollector {
    video_size: (u32, u32),
    points: Vec<ScreenPoint>,
    selecting: bool,
}

impl PointCollector {
    pub fn new(video_width: u32, video_height: u32) -> Self {
        Self {
            video_size: (video_width, video_height),
            points: Vec::with_capacity(CORNER_COUNT),
            selecting: false,
        }
    }

    /// Starts a fresh selection, discarding any earlier points.
    pub fn begin(&mut self) {
        self.points.clear();
        self.selecting = true;
    }

    /// Discards all points and leaves the selecting state.
    pub fn reset(&mut self) {
        self.points.clear();
        self.selecting = false;
    }

    pub fn is_selecting(&self) -> bool {
        self.selecting
    }

    pub fn points(&self) -> &[ScreenPoint] {
        &self.points
    }

    pub fn remaining(&self) -> usize {
        CORNER_COUNT - self.points.len()
    }

    pub fn video_size(&self) -> (u32, u32) {
        self.video_size
    }

    /// Updates the native size clicks are mapped into, e.g. after the
    /// camera renegotiated its format.
    pub fn set_video_size(&mut self, width: u32, height: u32) {
        self.video_size = (width, height);
    }

    /// Records a click at `pos` on a surface of `display_size` pixels.
    ///
    /// On the fourth click the set is validated; a degenerate set is
    /// discarded and selection restarts from zero.
    pub fn click(&mut self, pos: ScreenPoint, display_size: (u32, u32)) -> Result<ClickOutcome> {
        if !self.selecting || self.points.len() >= CORNER_COUNT {
            return Ok(ClickOutcome::Ignored);
        }

        let point = self.to_video_space(pos, display_size);
        self.points.push(point);
        tracing::debug!(
            "Corner {} at ({:.1}, {:.1})",
            self.points.len(),
            point.x,
            point.y
        );

        if self.points.len() < CORNER_COUNT {
            return Ok(ClickOutcome::Recorded(self.points.len()));
        }

        if let Err(e) = check_configuration(&self.points, true) {
            tracing::warn!("Rejected corner set: {}", e);
            self.points.clear();
            return Err(e);
        }

        self.selecting = false;
        let corners = [self.points[0], self.points[1], self.points[2], self.points[3]];
        Ok(ClickOutcome::Completed(corners))
    }

    fn to_video_space(&self, pos: ScreenPoint, display_size: (u32, u32)) -> ScreenPoint {
        let (vw, vh) = self.video_size;
        let (dw, dh) = display_size;
        if dw == 0 || dh == 0 || (vw, vh) == (dw, dh) {
            return pos;
        }
        ScreenPoint::new(
            pos.x * vw as f64 / dw as f64,
            pos.y * vh as f64 / dh as f64,
        )
    }

    /// Draws the collected points and the edges between consecutive ones.
    pub fn draw_markers(&self, canvas: &mut RgbImage) {
        for pair in self.points.windows(2) {
            draw_line_segment_mut(
                canvas,
                (pair[0].x as f32, pair[0].y as f32),
                (pair[1].x as f32, pair[1].y as f32),
                MARKER_COLOR,
            );
        }
        if self.points.len() == CORNER_COUNT {
            let (first, last) = (self.points[0], self.points[CORNER_COUNT - 1]);
            draw_line_segment_mut(
                canvas,
                (last.x as f32, last.y as f32),
                (first.x as f32, first.y as f32),
                MARKER_COLOR,
            );
        }
        for p in &self.points {
            draw_filled_circle_mut(
                canvas,
                (p.x.round() as i32, p.y.round() as i32),
                MARKER_RADIUS,
                MARKER_COLOR,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn click(c: &mut PointCollector, x: f64, y: f64, display: (u32, u32)) -> ClickOutcome {
        c.click(ScreenPoint::new(x, y), display).unwrap()
    }

    #[test]
    fn four_clicks_complete_and_fifth_is_ignored() {
        let mut c = PointCollector::new(200, 200);
        c.begin();
        assert_eq!(click(&mut c, 10.0, 10.0, (200, 200)), ClickOutcome::Recorded(1));
        assert_eq!(click(&mut c, 100.0, 10.0, (200, 200)), ClickOutcome::Recorded(2));
        assert_eq!(click(&mut c, 100.0, 100.0, (200, 200)), ClickOutcome::Recorded(3));

        let expected = [
            ScreenPoint::new(10.0, 10.0),
            ScreenPoint::new(100.0, 10.0),
            ScreenPoint::new(100.0, 100.0),
            ScreenPoint::new(10.0, 100.0),
        ];
        assert_eq!(
            click(&mut c, 10.0, 100.0, (200, 200)),
            ClickOutcome::Completed(expected)
        );
        assert!(!c.is_selecting());

        assert_eq!(click(&mut c, 50.0, 50.0, (200, 200)), ClickOutcome::Ignored);
        assert_eq!(c.points(), &expected);
    }

    #[test]
    fn clicks_scale_into_video_space() {
        let mut c = PointCollector::new(1280, 720);
        c.begin();
        click(&mut c, 320.0, 180.0, (640, 360));
        assert_eq!(c.points()[0], ScreenPoint::new(640.0, 360.0));
    }

    #[test]
    fn clicks_before_begin_are_ignored() {
        let mut c = PointCollector::new(200, 200);
        assert_eq!(click(&mut c, 1.0, 1.0, (200, 200)), ClickOutcome::Ignored);
        assert!(c.points().is_empty());
    }

    #[test]
    fn collinear_corners_restart_selection() {
        let mut c = PointCollector::new(200, 200);
        c.begin();
        for x in [10.0, 50.0, 90.0] {
            click(&mut c, x, 20.0, (200, 200));
        }
        let err = c.click(ScreenPoint::new(130.0, 20.0), (200, 200)).unwrap_err();
        assert!(matches!(err, Error::DegenerateGeometry(_)));
        assert!(c.is_selecting());
        assert_eq!(c.remaining(), 4);
    }

    #[test]
    fn reset_discards_points() {
        let mut c = PointCollector::new(200, 200);
        c.begin();
        click(&mut c, 10.0, 10.0, (200, 200));
        c.reset();
        assert!(c.points().is_empty());
        assert!(!c.is_selecting());
    }

    #[test]
    fn markers_are_drawn_at_points() {
        let mut c = PointCollector::new(64, 64);
        c.begin();
        click(&mut c, 8.0, 8.0, (64, 64));
        click(&mut c, 40.0, 8.0, (64, 64));
        let mut canvas = RgbImage::new(64, 64);
        c.draw_markers(&mut canvas);
        assert_eq!(*canvas.get_pixel(8, 8), MARKER_COLOR);
        assert_eq!(*canvas.get_pixel(24, 8), MARKER_COLOR);
        assert_eq!(*canvas.get_pixel(24, 40), Rgb([0, 0, 0]));
    }
}
