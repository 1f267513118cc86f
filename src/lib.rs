//!
//! # markercal
//!
//! Online intrinsic calibration of a camera from a planar board of fiducial markers.
//!
//! Frames go in as [`MarkerObservation`]s (marker ids with their image corners), matched
//! against a [`ReferenceBoard`]. A [`CalibrationSession`] collects the frames that match
//! enough markers and keeps re-solving the pinhole + Brown-Conrady model in a background
//! thread, so capture never waits on the solver.
//!

#![forbid(unsafe_code)]
#![deny(unused_must_use, clippy::unconditional_recursion)]

pub mod board;
pub mod camera;
pub mod correspondence;
pub mod logger;
pub mod session;
pub mod solve;

pub use board::ReferenceBoard;
pub use camera::{CameraIntrinsics, Distortion, ImageSize, Pose};
pub use correspondence::{DetectedMarker, MarkerObservation};
pub use session::{CalibrationSession, CalibrationSnapshot, SessionSettings, Status};
pub use solve::{calibrate, Calibration, SolveError, SolveOptions};
