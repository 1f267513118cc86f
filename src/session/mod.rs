//!
//! # Calibration sessions
//!
//! A [`CalibrationSession`] accepts marker observations from any number of threads, keeps
//! the views that match enough board markers, and re-solves the camera intrinsics in the
//! background whenever new views arrive and there are enough of them.
//!
//! ```no_run
//! use markercal::{camera::ImageSize, session::{CalibrationSession, SessionSettings}};
//!
//! let session = CalibrationSession::new(SessionSettings::new(ImageSize::new(1280, 720), 0.04))?;
//! # let frames: Vec<markercal::correspondence::MarkerObservation> = Vec::new();
//! for obs in &frames {
//!     session.submit_view(obs);
//! }
//! println!("{}", session.status());
//! # Ok::<(), markercal_core::Error>(())
//! ```
//!

mod buffer;
mod engine;
mod status;

use markercal_core::prelude::*;
use snafu::prelude::*;
use std::{sync::Arc, thread, time::Duration};

use crate::{
    board::ReferenceBoard,
    camera::{CameraIntrinsics, ImageSize, Pose},
    correspondence::{resolve, MarkerObservation, ViewCorrespondences},
    solve::{SolveOptions, MIN_SOLVE_VIEWS},
};
use engine::{Shared, Worker};
pub use status::Status;

/// Everything a session needs to run
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub image_size: ImageSize,
    /// Physical edge length of one marker, in meters
    pub marker_size: f64,
    pub board: ReferenceBoard,
    /// Known calibration to start from
    pub prior: Option<CameraIntrinsics>,
    /// Worker period
    pub tick: Duration,
    /// Views needed before the first solve
    pub min_views: usize,
    /// Matched markers needed for a frame to count as a view
    pub min_markers: usize,
    pub solver: SolveOptions,
}
impl SessionSettings {
    /// Settings for the built-in board with default thresholds
    pub fn new(image_size: ImageSize, marker_size: f64) -> Self {
        Self {
            image_size,
            marker_size,
            board: ReferenceBoard::default(),
            prior: None,
            tick: Duration::from_millis(100),
            min_views: 4,
            min_markers: 3,
            solver: SolveOptions::default(),
        }
    }

    pub fn with_board(mut self, board: ReferenceBoard) -> Self {
        self.board = board;
        self
    }

    pub fn with_prior(mut self, prior: CameraIntrinsics) -> Self {
        self.prior = Some(prior);
        self
    }

    /// Build settings from the on-disk configuration
    ///
    /// Loads the board file when one is configured and parses the JSON prior.
    #[instrument(skip_all)]
    pub fn from_config(cfg: &Config) -> Result<Self, Error> {
        let board = match &cfg.board.path {
            Some(path) => ReferenceBoard::load(path)?,
            None => ReferenceBoard::default(),
        };
        let prior = cfg
            .camera
            .prior
            .as_deref()
            .map(|json| {
                serde_json::from_str::<CameraIntrinsics>(json).map_err(|err| Error::InvalidPrior {
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let settings = Self {
            image_size: ImageSize::new(cfg.camera.width, cfg.camera.height),
            marker_size: cfg.board.marker_size,
            board,
            prior,
            tick: Duration::from_millis(cfg.engine.tick_ms),
            min_views: cfg.engine.min_views,
            min_markers: cfg.engine.min_markers,
            solver: SolveOptions::from(&cfg.solver),
        };
        settings.validate()?;

        Ok(settings)
    }

    /// Check the settings without starting anything
    pub fn validate(&self) -> Result<(), Error> {
        let ImageSize { width, height } = self.image_size;
        ensure!(!self.image_size.is_empty(), InvalidImageSizeSnafu { width, height });
        ensure!(
            self.marker_size.is_finite() && self.marker_size > 0.0,
            InvalidMarkerSizeSnafu {
                size: self.marker_size
            }
        );
        ensure!(
            self.min_views >= MIN_SOLVE_VIEWS,
            InvalidThresholdSnafu {
                name: "min_views",
                value: self.min_views,
            }
        );
        ensure!(
            self.min_markers >= 1,
            InvalidThresholdSnafu {
                name: "min_markers",
                value: self.min_markers,
            }
        );
        ensure!(
            self.solver.max_iterations >= 1,
            InvalidThresholdSnafu {
                name: "max_iterations",
                value: self.solver.max_iterations,
            }
        );
        ensure!(
            !self.tick.is_zero(),
            InvalidThresholdSnafu {
                name: "tick_ms",
                value: 0usize,
            }
        );
        self.board.validate()?;

        if let Some(prior) = &self.prior {
            ensure!(
                prior.is_finite(),
                InvalidPriorSnafu {
                    reason: "non-finite or non-positive parameters",
                }
            );
            ensure!(
                prior.image_size == self.image_size,
                InvalidPriorSnafu {
                    reason: format!(
                        "prior is for {}x{}, camera is {width}x{height}",
                        prior.image_size.width, prior.image_size.height
                    ),
                }
            );
        }

        Ok(())
    }

    /// Validate, then bring the board and prior into the form the engine works with
    fn prepare(mut self) -> Result<Self, Error> {
        self.validate()?;
        self.board = self.board.convert_to_metric(self.marker_size)?;
        if let Some(prior) = &mut self.prior {
            prior.valid = true;
        }

        Ok(self)
    }
}

/// Everything the last solve produced, together with the views it used
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSnapshot {
    pub intrinsics: CameraIntrinsics,
    pub valid: bool,
    /// Reprojection error of the last successful solve
    pub rms: Option<f64>,
    pub views: Vec<ViewCorrespondences>,
    /// Board pose per committed view, from the last successful solve
    ///
    /// Always as long as `views`. Views committed after that solve, or left out of it,
    /// have no pose.
    pub poses: Vec<Option<Pose>>,
}

/// An incremental calibration of one camera
#[derive(Debug)]
pub struct CalibrationSession {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}
impl CalibrationSession {
    /// Validate `settings` and start the background worker
    #[instrument(skip_all)]
    pub fn new(settings: SessionSettings) -> Result<Self, Error> {
        let settings = settings.prepare()?;
        info!(
            "starting session for {}x{} with board '{}'",
            settings.image_size.width,
            settings.image_size.height,
            settings.board.name()
        );

        let shared = Arc::new(Shared::new(settings));
        let worker = Worker::spawn(shared.clone())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Replace the configuration, discarding every view collected so far
    ///
    /// Invalid settings are rejected before anything is stopped. Otherwise this waits for
    /// the worker's in-flight tick, resets the session and restarts the worker.
    #[instrument(skip_all)]
    pub fn configure(&self, settings: SessionSettings) -> Result<(), Error> {
        let settings = settings.prepare()?;

        let mut worker = self.worker.lock();
        if let Some(running) = worker.take() {
            running.stop();
        }
        self.shared.reset(settings);
        *worker = Some(Worker::spawn(self.shared.clone())?);
        info!("session reconfigured");

        Ok(())
    }

    /// Offer one frame's detections; returns whether it was kept as a view
    pub fn submit_view(&self, observation: &MarkerObservation) -> bool {
        let settings = self.shared.settings.read();
        let view = resolve(observation, &settings.board);

        self.shared.buffer.submit(
            view,
            settings.min_markers,
            settings.min_views,
            &self.shared.status,
        )
    }

    /// The published intrinsics and whether they are calibrated
    ///
    /// Waits for a solve in progress.
    pub fn current_intrinsics(&self) -> (bool, CameraIntrinsics) {
        let calib = self.shared.calib.lock();
        (calib.intrinsics.valid, calib.intrinsics)
    }

    pub fn status(&self) -> String {
        self.shared.status.get()
    }

    /// Committed plus staged views
    pub fn view_count(&self) -> usize {
        let calib = self.shared.calib.lock();
        self.shared.buffer.total_with(calib.views.len())
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        let calib = self.shared.calib.lock();
        let mut poses = calib.poses.clone();
        poses.resize(calib.views.len(), None);

        CalibrationSnapshot {
            intrinsics: calib.intrinsics,
            valid: calib.intrinsics.valid,
            rms: calib.rms,
            views: calib.views.clone(),
            poses,
        }
    }

    /// The settings in effect, with the board in meters
    pub fn settings(&self) -> Arc<SessionSettings> {
        self.shared.settings.read().clone()
    }

    /// Block until every staged view has been merged and the resulting tick has finished
    ///
    /// Returns immediately if the worker is stopped.
    pub fn wait_idle(&self) {
        let tick = self.shared.settings.read().tick;
        loop {
            if self.worker.lock().is_none() {
                return;
            }
            if self.shared.buffer.staged_len() == 0 {
                let _calib = self.shared.calib.lock();
                if self.shared.buffer.staged_len() == 0 {
                    return;
                }
            }
            thread::sleep(tick / 2);
        }
    }

    /// Stop the background worker; views submitted afterwards stay staged
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}
impl Drop for CalibrationSession {
    fn drop(&mut self) {
        self.stop();
    }
}
