//!
//! Background worker merging staged views and re-solving
//!

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use markercal_core::prelude::*;
use snafu::prelude::*;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use super::{
    buffer::ObservationBuffer,
    status::{Status, StatusBoard},
    SessionSettings,
};
use crate::{
    camera::{CameraIntrinsics, Pose},
    correspondence::ViewCorrespondences,
    solve::calibrate,
};

/// Everything guarded by the calibration lock
#[derive(Debug, Clone)]
pub(crate) struct CalibState {
    pub views: Vec<ViewCorrespondences>,
    pub intrinsics: CameraIntrinsics,
    pub rms: Option<f64>,
    pub poses: Vec<Option<Pose>>,
}
impl CalibState {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            views: Vec::new(),
            intrinsics: settings
                .prior
                .unwrap_or_else(|| CameraIntrinsics::uncalibrated(settings.image_size)),
            rms: None,
            poses: Vec::new(),
        }
    }
}

/// State shared between a session and its worker
///
/// Lock order: settings, then calibration, then staging. The status lock is a leaf.
#[derive(Debug)]
pub(crate) struct Shared {
    pub settings: RwLock<Arc<SessionSettings>>,
    pub buffer: ObservationBuffer,
    pub calib: Mutex<CalibState>,
    pub status: StatusBoard,
}
impl Shared {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            buffer: ObservationBuffer::new(),
            calib: Mutex::new(CalibState::new(&settings)),
            status: StatusBoard::new(Status::NeedMore(settings.min_views)),
            settings: RwLock::new(Arc::new(settings)),
        }
    }

    /// Replace the settings and discard everything collected under the old ones
    ///
    /// Must not run while a worker is alive.
    pub fn reset(&self, settings: SessionSettings) {
        let mut current = self.settings.write();
        let mut calib = self.calib.lock();
        *calib = CalibState::new(&settings);
        self.buffer.clear();
        self.status.set(Status::NeedMore(settings.min_views));
        *current = Arc::new(settings);
    }
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Idle,
    Merged,
    Solved,
    Failed,
}

/// Merge staged views and re-solve if anything new arrived and there is enough data
pub(crate) fn tick(shared: &Shared, settings: &SessionSettings) -> Tick {
    let mut calib = shared.calib.lock();
    let arrived = shared.buffer.drain_into(&mut calib.views);
    if arrived == 0 {
        return Tick::Idle;
    }
    let views = calib.views.len();
    debug!("merged {arrived} views, {views} committed");
    if views < settings.min_views {
        return Tick::Merged;
    }

    shared.status.set(Status::Calibrating);
    let prior = if calib.intrinsics.valid {
        Some(calib.intrinsics)
    } else {
        settings.prior
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        calibrate(&calib.views, settings.image_size, prior.as_ref(), &settings.solver)
    }));

    match result {
        Ok(Ok(cal)) => {
            info!(
                fx = cal.intrinsics.fx,
                fy = cal.intrinsics.fy,
                cx = cal.intrinsics.cx,
                cy = cal.intrinsics.cy,
                rms = cal.rms,
                "calibrated from {views} views"
            );
            calib.intrinsics = cal.intrinsics;
            calib.rms = Some(cal.rms);
            calib.poses = cal.poses;
            shared.status.set(Status::Calibrated { rms: cal.rms, views });
            Tick::Solved
        }
        Ok(Err(err)) => {
            warn!("calibration failed with {views} views: {err}");
            shared.status.set(Status::Failed {
                reason: err.to_string(),
                views,
            });
            Tick::Failed
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "solver panicked".to_owned());
            error!("solver panicked: {reason}");
            shared.status.set(Status::Failed { reason, views });
            Tick::Failed
        }
    }
}

/// Handle to a running worker thread
#[derive(Debug)]
pub(crate) struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}
impl Worker {
    pub fn spawn(shared: Arc<Shared>) -> Result<Self, Error> {
        let settings = shared.settings.read().clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("markercal-worker".to_owned())
            .spawn(move || {
                debug!("worker started");
                loop {
                    let outcome = tick(&shared, &settings);
                    trace!(?outcome, "tick");

                    match stop_rx.recv_timeout(settings.tick) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("worker stopped");
            })
            .context(FailedToSpawnWorkerSnafu)?;

        Ok(Self { stop_tx, handle })
    }

    /// Signal the worker and wait for its in-flight tick to finish
    #[instrument(skip(self))]
    pub fn stop(self) {
        trace!("sending stop msg");
        match self.stop_tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => trace!("stop msg already pending"),
            Err(TrySendError::Disconnected(())) => trace!("worker already exited"),
        }
        trace!("joining thread");
        if self.handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}
