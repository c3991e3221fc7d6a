//! The alignment controller: owns all per-session state and drives one
//! tracking cycle per video frame.

use crate::capture::GrayFrame;
use crate::error::{Error, Result};
use crate::geometry::{check_configuration, ScreenPoint};
use crate::homography::{self, Homography, RansacConfig, MIN_CORRESPONDENCES};
use crate::overlay::{reference_corners, OverlayState, DEFAULT_OPACITY};
use crate::points::{ClickOutcome, PointCollector};
use crate::tracking::{TrackedPointSet, TrackerBackend};
use nalgebra::Matrix3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    CollectingPoints,
    Tracking,
    /// Too few points survived; the overlay holds its last good transform
    /// until `redetect` or `reset`.
    Frozen,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ransac: RansacConfig,
    /// Consecutive cycles without a fresh transform before
    /// `needs_reselection` reports true. 0 never asks.
    pub reselect_after: u32,
    pub opacity: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ransac: RansacConfig::default(),
            reselect_after: 90,
            opacity: DEFAULT_OPACITY,
        }
    }
}

/// What one call to `cycle` did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No tracking session; manual placement applies.
    Inactive,
    /// First frame of a session stored and points seeded from it.
    Primed { points: usize },
    /// A new transform was published.
    Updated {
        points: usize,
        inliers: usize,
        dropped: usize,
    },
    /// The estimate failed this cycle; the previous transform stays.
    Held { reason: String },
    /// Tracking is frozen on the last good transform.
    Frozen { points: usize },
}

struct TrackingSession {
    /// Corners the current point set was seeded around.
    corners: [ScreenPoint; 4],
    /// Reference image space to the seeding frame.
    bootstrap: Homography,
    points: TrackedPointSet,
    /// Set together with `points` on the first cycle after (re)seeding.
    prev: Option<GrayFrame>,
    last_good: Homography,
}

pub struct AlignmentPipeline {
    config: PipelineConfig,
    backend: Box<dyn TrackerBackend>,
    collector: PointCollector,
    reference_dims: Option<(u32, u32)>,
    session: Option<TrackingSession>,
    overlay: OverlayState,
    state: PipelineState,
    stalled_cycles: u32,
}

impl AlignmentPipeline {
    pub fn new(
        config: PipelineConfig,
        backend: Box<dyn TrackerBackend>,
        video_size: (u32, u32),
    ) -> Self {
        tracing::info!("Alignment pipeline using {} backend", backend.name());
        let overlay = OverlayState::new(config.opacity);
        Self {
            config,
            backend,
            collector: PointCollector::new(video_size.0, video_size.1),
            reference_dims: None,
            session: None,
            overlay,
            state: PipelineState::Idle,
            stalled_cycles: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn overlay(&self) -> &OverlayState {
        &self.overlay
    }

    pub fn collector(&self) -> &PointCollector {
        &self.collector
    }

    /// Current positions of the tracked points, if a session is running.
    pub fn tracked_points(&self) -> Option<&[ScreenPoint]> {
        self.session.as_ref().map(|s| s.points.current())
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.overlay.set_opacity(opacity);
    }

    /// Manual rotation; has no effect while a tracking session is active.
    pub fn set_rotation(&mut self, degrees: f64) -> bool {
        self.overlay.set_rotation(degrees)
    }

    /// Updates the native frame size. A running session is carried over by
    /// scaling its last good transform and re-seeding on the next frame.
    pub fn set_video_size(&mut self, width: u32, height: u32) {
        let old = self.collector.video_size();
        self.collector.set_video_size(width, height);
        if old == (width, height) || old.0 == 0 || old.1 == 0 || self.session.is_none() {
            return;
        }
        tracing::info!(
            "Video size changed from {}x{} to {}x{}",
            old.0,
            old.1,
            width,
            height
        );
        if let Err(e) = self.rescale_session(old, (width, height)) {
            tracing::warn!("Cannot carry tracking across size change: {}", e);
            self.reset();
        }
    }

    fn rescale_session(&mut self, old: (u32, u32), new: (u32, u32)) -> Result<()> {
        let sx = new.0 as f64 / old.0 as f64;
        let sy = new.1 as f64 / old.1 as f64;
        let scale =
            Homography::from_matrix(Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0))?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let scaled = session.last_good.then(&scale)?;
        session.last_good = scaled;
        self.overlay.publish(scaled);

        if self.state == PipelineState::Tracking {
            return self.redetect();
        }
        // Frozen stays frozen; only the stale frame is dropped.
        if let Some(session) = self.session.as_mut() {
            session.prev = None;
        }
        Ok(())
    }

    /// Registers the reference raster size. A running session is ended
    /// because its transform was solved for the old dimensions.
    pub fn set_reference(&mut self, dims: (u32, u32)) {
        if self.session.is_some() && self.reference_dims != Some(dims) {
            tracing::info!("Reference changed, ending tracking session");
            self.reset();
        }
        self.reference_dims = Some(dims);
    }

    pub fn begin_point_selection(&mut self) -> Result<()> {
        if self.reference_dims.is_none() {
            return Err(Error::ReferenceMissing);
        }
        self.end_session();
        self.collector.begin();
        self.state = PipelineState::CollectingPoints;
        tracing::info!("Select {} reference points", self.collector.remaining());
        Ok(())
    }

    /// Feeds a click on a display of `display_size` pixels. The fourth
    /// valid click starts tracking.
    pub fn click(&mut self, pos: ScreenPoint, display_size: (u32, u32)) -> Result<ClickOutcome> {
        if self.state != PipelineState::CollectingPoints {
            return Ok(ClickOutcome::Ignored);
        }
        let outcome = self.collector.click(pos, display_size)?;
        if let ClickOutcome::Completed(corners) = outcome {
            self.start_tracking(corners)?;
        }
        Ok(outcome)
    }

    fn start_tracking(&mut self, corners: [ScreenPoint; 4]) -> Result<()> {
        let dims = self.reference_dims.ok_or(Error::ReferenceMissing)?;
        let reference = reference_corners(dims);
        let estimate = match homography::estimate(&reference, &corners, &self.config.ransac) {
            Ok(estimate) => estimate,
            Err(e) => {
                self.state = PipelineState::Idle;
                return Err(e);
            }
        };
        let bootstrap = estimate.homography;

        self.session = Some(TrackingSession {
            corners,
            bootstrap,
            points: TrackedPointSet::default(),
            prev: None,
            last_good: bootstrap,
        });
        self.overlay.publish(bootstrap);
        self.state = PipelineState::Tracking;
        self.stalled_cycles = 0;
        tracing::info!("Tracking started");
        Ok(())
    }

    /// Runs one tracking cycle on a freshly sampled frame.
    pub fn cycle(&mut self, frame: GrayFrame) -> CycleOutcome {
        match self.state {
            PipelineState::Idle | PipelineState::CollectingPoints => CycleOutcome::Inactive,
            PipelineState::Frozen => {
                self.stalled_cycles = self.stalled_cycles.saturating_add(1);
                let points = self.session.as_ref().map_or(0, |s| s.points.len());
                CycleOutcome::Frozen { points }
            }
            PipelineState::Tracking => self.track(frame),
        }
    }

    fn track(&mut self, frame: GrayFrame) -> CycleOutcome {
        let _span = tracing::debug_span!("track_cycle", frame = frame.sequence).entered();
        let Some(session) = self.session.as_mut() else {
            self.state = PipelineState::Idle;
            return CycleOutcome::Inactive;
        };

        let Some(prev) = session.prev.take() else {
            let seeds = self.backend.seed(&frame, &session.corners);
            session.points = TrackedPointSet::new(seeds);
            session.prev = Some(frame);
            tracing::debug!("Seeded {} points", session.points.len());
            return CycleOutcome::Primed {
                points: session.points.len(),
            };
        };

        tracing::debug!(
            "Flow over {:?} ({} points)",
            frame.captured_at.saturating_duration_since(prev.captured_at),
            session.points.len()
        );
        let tracks = self.backend.track(&prev, &frame, session.points.current());
        session.prev = Some(frame);
        let dropped = session.points.apply(&tracks);
        let points = session.points.len();

        if points < MIN_CORRESPONDENCES {
            tracing::warn!(
                "{}",
                Error::InsufficientCorrespondences {
                    needed: MIN_CORRESPONDENCES,
                    got: points,
                }
            );
            session.prev = None;
            self.state = PipelineState::Frozen;
            self.stalled_cycles = self.stalled_cycles.saturating_add(1);
            return CycleOutcome::Frozen { points };
        }

        let (anchors, current) = (session.points.anchors(), session.points.current());
        let result = homography::estimate(anchors, current, &self.config.ransac)
            .and_then(|est| Ok((session.bootstrap.then(&est.homography)?, est.n_inliers)));

        match result {
            Ok((h, inliers)) => {
                session.last_good = h;
                self.overlay.publish(h);
                self.stalled_cycles = 0;
                CycleOutcome::Updated {
                    points,
                    inliers,
                    dropped,
                }
            }
            Err(e) => {
                if e.is_recoverable() {
                    tracing::debug!("Holding last transform: {}", e);
                } else {
                    tracing::warn!("Holding last transform: {}", e);
                }
                self.stalled_cycles = self.stalled_cycles.saturating_add(1);
                CycleOutcome::Held {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Re-seeds the point set around where the last good transform puts
    /// the reference corners and resumes tracking.
    pub fn redetect(&mut self) -> Result<()> {
        let dims = self.reference_dims.ok_or(Error::ReferenceMissing)?;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::InsufficientCorrespondences {
                needed: MIN_CORRESPONDENCES,
                got: 0,
            });
        };

        let mut corners = [ScreenPoint::default(); 4];
        for (dst, src) in corners.iter_mut().zip(reference_corners(dims)) {
            *dst = session.last_good.project(src).ok_or_else(|| {
                Error::HomographySolveFailed("reference corner maps to infinity".into())
            })?;
        }
        check_configuration(&corners, true)?;

        session.corners = corners;
        session.bootstrap = session.last_good;
        session.points = TrackedPointSet::default();
        session.prev = None;
        self.backend.reset();
        self.state = PipelineState::Tracking;
        self.stalled_cycles = 0;
        tracing::info!("Re-detecting around last known placement");
        Ok(())
    }

    /// Consecutive cycles have failed long enough that the user should
    /// pick the corners again.
    pub fn needs_reselection(&self) -> bool {
        self.config.reselect_after > 0 && self.stalled_cycles >= self.config.reselect_after
    }

    fn end_session(&mut self) {
        self.session = None;
        self.backend.reset();
        self.overlay.release_tracking();
        self.stalled_cycles = 0;
    }

    /// Back to `Idle` from any state, releasing frames and points.
    pub fn reset(&mut self) {
        self.end_session();
        self.collector.reset();
        self.state = PipelineState::Idle;
        tracing::info!("Pipeline reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{OverlayRenderer, OverlayTransform};
    use crate::tracking::{OpticalFlowBackend, PointTrack, TrackStatus};
    use image::{GrayImage, Luma};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Script = Rc<RefCell<VecDeque<Vec<TrackStatus>>>>;

    /// Moves every point by a fixed offset and applies scripted statuses.
    struct ScriptedBackend {
        offset: (f64, f64),
        statuses: Script,
        resets: Rc<RefCell<usize>>,
    }

    impl TrackerBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn seed(&mut self, _frame: &GrayFrame, corners: &[ScreenPoint; 4]) -> Vec<ScreenPoint> {
            corners.to_vec()
        }

        fn track(
            &mut self,
            _prev: &GrayFrame,
            _curr: &GrayFrame,
            points: &[ScreenPoint],
        ) -> Vec<PointTrack> {
            let statuses = self.statuses.borrow_mut().pop_front();
            points
                .iter()
                .enumerate()
                .map(|(i, p)| PointTrack {
                    position: ScreenPoint::new(p.x + self.offset.0, p.y + self.offset.1),
                    status: statuses
                        .as_ref()
                        .and_then(|s| s.get(i).copied())
                        .unwrap_or(TrackStatus::Tracked),
                })
                .collect()
        }

        fn reset(&mut self) {
            *self.resets.borrow_mut() += 1;
        }
    }

    fn frame(seq: u64) -> GrayFrame {
        GrayFrame::new(GrayImage::new(200, 200), seq)
    }

    fn pipeline(script: Script) -> AlignmentPipeline {
        let backend = ScriptedBackend {
            offset: (2.0, 1.0),
            statuses: script,
            resets: Rc::new(RefCell::new(0)),
        };
        let mut p =
            AlignmentPipeline::new(PipelineConfig::default(), Box::new(backend), (200, 200));
        p.set_reference((90, 90));
        p
    }

    /// Renderer output for the current overlay state.
    fn rendered(p: &AlignmentPipeline) -> OverlayTransform {
        OverlayRenderer::transform((90, 90), (200, 200), p.overlay()).unwrap()
    }

    fn select_square(p: &mut AlignmentPipeline) {
        p.begin_point_selection().unwrap();
        for (x, y) in [(10.0, 10.0), (100.0, 10.0), (100.0, 100.0), (10.0, 100.0)] {
            p.click(ScreenPoint::new(x, y), (200, 200)).unwrap();
        }
    }

    #[test]
    fn selection_requires_reference() {
        let backend = ScriptedBackend {
            offset: (0.0, 0.0),
            statuses: Script::default(),
            resets: Rc::new(RefCell::new(0)),
        };
        let mut p =
            AlignmentPipeline::new(PipelineConfig::default(), Box::new(backend), (200, 200));
        assert!(matches!(p.begin_point_selection(), Err(Error::ReferenceMissing)));
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[test]
    fn four_clicks_start_tracking_with_bootstrap_transform() {
        let mut p = pipeline(Script::default());
        assert_eq!(p.cycle(frame(0)), CycleOutcome::Inactive);
        select_square(&mut p);
        assert_eq!(p.state(), PipelineState::Tracking);

        let h = *p.overlay().homography().unwrap();
        let corner = h.project(ScreenPoint::new(90.0, 90.0)).unwrap();
        assert!(corner.distance(&ScreenPoint::new(100.0, 100.0)) < 1e-6);
    }

    #[test]
    fn first_cycle_primes_then_flow_updates() {
        let mut p = pipeline(Script::default());
        select_square(&mut p);
        assert_eq!(p.cycle(frame(0)), CycleOutcome::Primed { points: 4 });
        assert_eq!(
            p.cycle(frame(1)),
            CycleOutcome::Updated {
                points: 4,
                inliers: 4,
                dropped: 0
            }
        );
        let h = p.overlay().homography().unwrap();
        let tl = h.project(ScreenPoint::new(0.0, 0.0)).unwrap();
        assert!(tl.distance(&ScreenPoint::new(12.0, 11.0)) < 1e-6);
    }

    #[test]
    fn losing_two_of_four_points_freezes_overlay() {
        let script = Script::default();
        let mut p = pipeline(script.clone());
        select_square(&mut p);
        p.cycle(frame(0));
        p.cycle(frame(1));
        let before = rendered(&p);

        script.borrow_mut().push_back(vec![
            TrackStatus::Tracked,
            TrackStatus::Lost,
            TrackStatus::OutOfBounds,
            TrackStatus::Tracked,
        ]);
        assert_eq!(p.cycle(frame(2)), CycleOutcome::Frozen { points: 2 });
        assert_eq!(p.state(), PipelineState::Frozen);
        assert_eq!(rendered(&p), before);

        // Frozen never resumes on its own.
        assert_eq!(p.cycle(frame(3)), CycleOutcome::Frozen { points: 2 });
        assert_eq!(p.state(), PipelineState::Frozen);
        assert_eq!(rendered(&p), before);
    }

    #[test]
    fn redetect_resumes_from_last_good_transform() {
        let script = Script::default();
        let mut p = pipeline(script.clone());
        select_square(&mut p);
        p.cycle(frame(0));
        p.cycle(frame(1));
        script.borrow_mut().push_back(vec![TrackStatus::Lost; 4]);
        p.cycle(frame(2));
        assert_eq!(p.state(), PipelineState::Frozen);

        p.redetect().unwrap();
        assert_eq!(p.state(), PipelineState::Tracking);
        assert_eq!(p.cycle(frame(3)), CycleOutcome::Primed { points: 4 });
        assert!(matches!(p.cycle(frame(4)), CycleOutcome::Updated { .. }));

        // Two successful steps of (2, 1) in total.
        let tl = p.overlay().homography().unwrap().project(ScreenPoint::new(0.0, 0.0)).unwrap();
        assert!(tl.distance(&ScreenPoint::new(14.0, 12.0)) < 1e-6, "{tl:?}");
    }

    #[test]
    fn reset_returns_to_idle_and_manual_mode() {
        let mut p = pipeline(Script::default());
        select_square(&mut p);
        p.cycle(frame(0));
        p.reset();
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.overlay().homography().is_none());
        assert!(p.tracked_points().is_none());
        assert!(p.collector().points().is_empty());
        assert!(p.set_rotation(30.0));
    }

    #[test]
    fn rotation_is_ignored_while_tracking() {
        let mut p = pipeline(Script::default());
        select_square(&mut p);
        assert!(!p.set_rotation(30.0));
    }

    #[test]
    fn stalled_cycles_request_reselection() {
        let script = Script::default();
        let backend = ScriptedBackend {
            offset: (0.0, 0.0),
            statuses: script.clone(),
            resets: Rc::new(RefCell::new(0)),
        };
        let config = PipelineConfig {
            reselect_after: 3,
            ..PipelineConfig::default()
        };
        let mut p = AlignmentPipeline::new(config, Box::new(backend), (200, 200));
        p.set_reference((90, 90));
        select_square(&mut p);
        p.cycle(frame(0));
        script.borrow_mut().push_back(vec![TrackStatus::Lost; 4]);
        p.cycle(frame(1));
        assert!(!p.needs_reselection());
        p.cycle(frame(2));
        p.cycle(frame(3));
        assert!(p.needs_reselection());
        p.reset();
        assert!(!p.needs_reselection());
    }

    #[test]
    fn changing_reference_ends_session() {
        let mut p = pipeline(Script::default());
        select_square(&mut p);
        p.set_reference((40, 30));
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(p.overlay().homography().is_none());
    }

    /// Reports every point on one horizontal line.
    struct CollapsingBackend;

    impl TrackerBackend for CollapsingBackend {
        fn name(&self) -> &'static str {
            "collapsing"
        }

        fn seed(&mut self, _frame: &GrayFrame, corners: &[ScreenPoint; 4]) -> Vec<ScreenPoint> {
            corners.to_vec()
        }

        fn track(
            &mut self,
            _prev: &GrayFrame,
            _curr: &GrayFrame,
            points: &[ScreenPoint],
        ) -> Vec<PointTrack> {
            (0..points.len())
                .map(|i| PointTrack::tracked(ScreenPoint::new(10.0 * i as f64, 5.0)))
                .collect()
        }
    }

    #[test]
    fn collinear_points_hold_the_last_transform() {
        let config = PipelineConfig {
            reselect_after: 2,
            ..PipelineConfig::default()
        };
        let mut p = AlignmentPipeline::new(config, Box::new(CollapsingBackend), (200, 200));
        p.set_reference((90, 90));
        select_square(&mut p);
        assert_eq!(p.cycle(frame(0)), CycleOutcome::Primed { points: 4 });
        let before = rendered(&p);

        let outcome = p.cycle(frame(1));
        assert!(
            matches!(&outcome, CycleOutcome::Held { reason } if reason.contains("collinear")),
            "{outcome:?}"
        );
        assert_eq!(p.state(), PipelineState::Tracking);
        assert_eq!(rendered(&p), before);
        assert!(!p.needs_reselection());

        assert!(matches!(p.cycle(frame(2)), CycleOutcome::Held { .. }));
        assert_eq!(p.state(), PipelineState::Tracking);
        assert_eq!(rendered(&p), before);
        assert!(p.needs_reselection());
    }

    fn texture(dx: f64, dy: f64, seq: u64) -> GrayFrame {
        let img = GrayImage::from_fn(320, 240, |x, y| {
            let (x, y) = (x as f64 - dx, y as f64 - dy);
            let v = 128.0
                + 50.0 * (x / 6.0).sin()
                + 50.0 * (y / 7.0).cos()
                + 20.0 * ((x + y) / 9.0).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        });
        GrayFrame::new(img, seq)
    }

    #[test]
    fn optical_flow_keeps_overlay_on_a_sliding_sheet() {
        let backend = OpticalFlowBackend::default();
        let mut p =
            AlignmentPipeline::new(PipelineConfig::default(), Box::new(backend), (320, 240));
        p.set_reference((140, 120));
        p.begin_point_selection().unwrap();
        for (x, y) in [(80.0, 60.0), (220.0, 60.0), (220.0, 180.0), (80.0, 180.0)] {
            p.click(ScreenPoint::new(x, y), (320, 240)).unwrap();
        }

        let primed = p.cycle(texture(0.0, 0.0, 0));
        assert!(matches!(primed, CycleOutcome::Primed { points } if points > 4), "{primed:?}");
        for k in 1..=10u64 {
            let outcome = p.cycle(texture(2.0 * k as f64, k as f64, k));
            assert!(matches!(outcome, CycleOutcome::Updated { .. }), "cycle {k}: {outcome:?}");
        }

        // Ten steps of (2, 1).
        let h = p.overlay().homography().unwrap();
        let tl = h.project(ScreenPoint::new(0.0, 0.0)).unwrap();
        let br = h.project(ScreenPoint::new(140.0, 120.0)).unwrap();
        assert!(tl.distance(&ScreenPoint::new(100.0, 70.0)) < 0.5, "{tl:?}");
        assert!(br.distance(&ScreenPoint::new(240.0, 190.0)) < 0.5, "{br:?}");
    }

    #[test]
    fn size_change_rescales_and_reseeds() {
        let mut p = pipeline(Script::default());
        select_square(&mut p);
        p.cycle(frame(0));
        p.cycle(frame(1));

        p.set_video_size(400, 400);
        assert_eq!(p.state(), PipelineState::Tracking);
        assert_eq!(p.collector().video_size(), (400, 400));
        let tl = p.overlay().homography().unwrap().project(ScreenPoint::new(0.0, 0.0)).unwrap();
        assert!(tl.distance(&ScreenPoint::new(24.0, 22.0)) < 1e-6, "{tl:?}");

        let larger = GrayFrame::new(GrayImage::new(400, 400), 2);
        assert_eq!(p.cycle(larger), CycleOutcome::Primed { points: 4 });
    }

    #[test]
    fn size_change_while_frozen_stays_frozen() {
        let script = Script::default();
        let mut p = pipeline(script.clone());
        select_square(&mut p);
        p.cycle(frame(0));
        script.borrow_mut().push_back(vec![TrackStatus::Lost; 4]);
        p.cycle(frame(1));
        assert_eq!(p.state(), PipelineState::Frozen);

        p.set_video_size(100, 100);
        assert_eq!(p.state(), PipelineState::Frozen);
        let br = p.overlay().homography().unwrap().project(ScreenPoint::new(90.0, 90.0)).unwrap();
        assert!(br.distance(&ScreenPoint::new(50.0, 50.0)) < 1e-6, "{br:?}");
    }
}
