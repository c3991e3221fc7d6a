mod flow;
mod marker;
mod pyramid;

pub use flow::{FlowConfig, OpticalFlowBackend};
pub use marker::{DarkQuadLocator, MarkerBackend, MarkerLocator};
pub use pyramid::Pyramid;

use crate::capture::GrayFrame;
use crate::geometry::ScreenPoint;

/// Outcome for one point after a frame-to-frame pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Tracked,
    /// Solver diverged, the patch had no texture, or the marker vanished
    Lost,
    /// Final position fell outside the frame
    OutOfBounds,
}

/// Updated position and status for one input point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointTrack {
    pub position: ScreenPoint,
    pub status: TrackStatus,
}

impl PointTrack {
    pub fn tracked(position: ScreenPoint) -> Self {
        Self {
            position,
            status: TrackStatus::Tracked,
        }
    }

    pub fn lost(position: ScreenPoint) -> Self {
        Self {
            position,
            status: TrackStatus::Lost,
        }
    }
}

/// Trait for point tracking strategies
/// Allows swapping between optical flow and fiducial marker tracking
pub trait TrackerBackend {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Build the initial point set for a tracking session
    ///
    /// The four corners always come first, in the order given.
    fn seed(&mut self, frame: &GrayFrame, corners: &[ScreenPoint; 4]) -> Vec<ScreenPoint>;

    /// Estimate where each of `points` (positions in `prev`) lies in `curr`
    ///
    /// Returns exactly one entry per input point.
    fn track(
        &mut self,
        prev: &GrayFrame,
        curr: &GrayFrame,
        points: &[ScreenPoint],
    ) -> Vec<PointTrack>;

    /// Drop internal state between sessions
    fn reset(&mut self) {
        // Default implementation: no-op for stateless backends
    }
}

/// Points followed across frames, paired with where they were seeded.
#[derive(Debug, Clone, Default)]
pub struct TrackedPointSet {
    anchors: Vec<ScreenPoint>,
    current: Vec<ScreenPoint>,
}

impl TrackedPointSet {
    pub fn new(seeds: Vec<ScreenPoint>) -> Self {
        Self {
            anchors: seeds.clone(),
            current: seeds,
        }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Positions at seed time, in the seeding frame
    pub fn anchors(&self) -> &[ScreenPoint] {
        &self.anchors
    }

    /// Best estimate in the latest frame
    pub fn current(&self) -> &[ScreenPoint] {
        &self.current
    }

    /// Moves tracked points and drops the rest. Returns how many were dropped.
    pub fn apply(&mut self, tracks: &[PointTrack]) -> usize {
        debug_assert_eq!(tracks.len(), self.current.len());
        let before = self.current.len();

        let mut anchors = Vec::with_capacity(before);
        let mut current = Vec::with_capacity(before);
        for (anchor, track) in self.anchors.iter().zip(tracks) {
            if track.status == TrackStatus::Tracked {
                anchors.push(*anchor);
                current.push(track.position);
            }
        }
        self.anchors = anchors;
        self.current = current;

        before - self.current.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_drops_lost_points_with_their_anchors() {
        let mut set = TrackedPointSet::new(vec![
            ScreenPoint::new(0.0, 0.0),
            ScreenPoint::new(1.0, 0.0),
            ScreenPoint::new(2.0, 0.0),
        ]);
        let dropped = set.apply(&[
            PointTrack::tracked(ScreenPoint::new(0.5, 0.5)),
            PointTrack::lost(ScreenPoint::new(9.0, 9.0)),
            PointTrack {
                position: ScreenPoint::new(2.5, 0.5),
                status: TrackStatus::OutOfBounds,
            },
        ]);
        assert_eq!(dropped, 2);
        assert_eq!(set.anchors(), &[ScreenPoint::new(0.0, 0.0)]);
        assert_eq!(set.current(), &[ScreenPoint::new(0.5, 0.5)]);
    }
}
