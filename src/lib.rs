//! Locks a reference image onto a sheet of paper in a live camera feed.
//!
//! The user marks the sheet's four corners; from then on the corners are
//! followed from frame to frame and the reference is warped onto them with
//! a robustly fitted homography.

pub mod capture;
pub mod error;
pub mod geometry;
pub mod homography;
pub mod output;
pub mod overlay;
pub mod pipeline;
pub mod points;
pub mod session;
pub mod tracking;

pub use error::{Error, Result};
