use markercal_core::prelude::*;
use std::fmt;

/// Progress messages published by a session
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    NeedMore(usize),
    Calibrating,
    Calibrated { rms: f64, views: usize },
    Failed { reason: String, views: usize },
}
impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeedMore(n) => write!(f, "Not calibrated. Need at least {n} more images"),
            Self::Calibrating => f.write_str("calibrating..."),
            Self::Calibrated { rms, views } => {
                write!(f, "calibration error: {rms:.4} using {views} images")
            }
            Self::Failed { reason, views } => {
                write!(f, "calibration failed: {reason} using {views} images")
            }
        }
    }
}

/// The status string, behind its own lock so polling never waits on a solve
#[derive(Debug, Default)]
pub(crate) struct StatusBoard(Mutex<String>);
impl StatusBoard {
    pub fn new(initial: Status) -> Self {
        Self(Mutex::new(initial.to_string()))
    }

    pub fn set(&self, status: Status) {
        let msg = status.to_string();
        trace!(status = %msg);
        *self.0.lock() = msg;
    }

    pub fn get(&self) -> String {
        self.0.lock().clone()
    }
}
