use thiserror::Error;

/// Errors raised by the alignment pipeline.
///
/// Device errors are terminal for a session. The tracking kinds are
/// recovered per cycle by holding the last good homography.
#[derive(Debug, Error)]
pub enum Error {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("insufficient correspondences: need {needed}, got {got}")]
    InsufficientCorrespondences { needed: usize, got: usize },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("homography solve failed: {0}")]
    HomographySolveFailed(String),

    #[error("no reference image loaded")]
    ReferenceMissing,

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    /// True for the per-cycle tracking failures that freeze the overlay
    /// instead of ending the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientCorrespondences { .. }
                | Error::DegenerateGeometry(_)
                | Error::HomographySolveFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
