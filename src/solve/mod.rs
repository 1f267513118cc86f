//!
//! Intrinsics calibration from planar board views
//!
//! A solve runs in three stages: starting intrinsics (a warm-start prior, or a closed-form
//! focal estimate), a linear pose per view from its plane homography, then a joint
//! Levenberg-Marquardt refinement of the intrinsics and every pose.
//!

mod bundle;
mod homography;
mod init;
pub mod lm;

use markercal_core::{config::SolverCfg, prelude::*};
use snafu::prelude::*;

use crate::{
    camera::{CameraIntrinsics, ImageSize, Pose},
    correspondence::ViewCorrespondences,
};
pub use bundle::{BundleProblem, BundleState};
pub use homography::dlt_homography;
pub use init::{estimate_view_pose, initial_intrinsics};
use lm::{LevenbergMarquardt, SolveReport, Termination};

/// Minimum number of usable views for a solve
pub const MIN_SOLVE_VIEWS: usize = 3;

/// Relative cost decrease above which hitting the iteration limit counts as divergence
const CONVERGED_DECREASE: f64 = 1e-3;

#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum SolveError {
    #[snafu(display("not enough usable views ({got}, need {MIN_SOLVE_VIEWS})"))]
    NotEnoughViews { got: usize },
    #[snafu(display("degenerate view: {reason}"))]
    DegenerateView { reason: String },
    #[snafu(display("normal equations are singular"))]
    Singular,
    #[snafu(display("non-finite cost or parameters"))]
    NonFinite,
    #[snafu(display("non-physical intrinsics (fx {fx}, fy {fy}, cx {cx}, cy {cy})"))]
    NonPhysical { fx: f64, fy: f64, cx: f64, cy: f64 },
    #[snafu(display("no convergence after {iterations} iterations"))]
    NotConverged { iterations: usize },
}

/// Stopping criteria of the refinement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOptions {
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
}
impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
        }
    }
}
impl From<&SolverCfg> for SolveOptions {
    fn from(cfg: &SolverCfg) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            ftol: cfg.ftol,
            xtol: cfg.xtol,
            gtol: cfg.gtol,
        }
    }
}

/// Result of a successful solve
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub intrinsics: CameraIntrinsics,
    /// Root mean square reprojection error in pixels
    pub rms: f64,
    /// Board pose of each input view; `None` for views that were left out
    pub poses: Vec<Option<Pose>>,
    pub report: SolveReport,
}

/// Calibrate from the given views
///
/// Views with fewer than 4 correspondences, or whose linear pose cannot be estimated, are
/// left out. A `prior` is used as the starting point when it is finite and matches
/// `image_size`.
#[instrument(skip_all, fields(views = views.len()))]
pub fn calibrate(
    views: &[ViewCorrespondences],
    image_size: ImageSize,
    prior: Option<&CameraIntrinsics>,
    opts: &SolveOptions,
) -> Result<Calibration, SolveError> {
    let candidates: Vec<usize> = (0..views.len()).filter(|&i| views[i].len() >= 4).collect();
    ensure!(
        candidates.len() >= MIN_SOLVE_VIEWS,
        NotEnoughViewsSnafu {
            got: candidates.len()
        }
    );

    let start = match prior {
        Some(p) if p.is_finite() && p.image_size == image_size => *p,
        Some(_) => {
            warn!("ignoring unusable prior");
            let refs: Vec<_> = candidates.iter().map(|&i| &views[i]).collect();
            initial_intrinsics(&refs, image_size)
        }
        None => {
            let refs: Vec<_> = candidates.iter().map(|&i| &views[i]).collect();
            initial_intrinsics(&refs, image_size)
        }
    };
    debug!(fx = start.fx, fy = start.fy, "starting intrinsics");

    let mut used = Vec::with_capacity(candidates.len());
    let mut poses = Vec::with_capacity(candidates.len());
    for &i in &candidates {
        match estimate_view_pose(&views[i], &start) {
            Ok(pose) => {
                used.push(i);
                poses.push(pose);
            }
            Err(err) => debug!("leaving out view {i}: {err}"),
        }
    }
    ensure!(
        used.len() >= MIN_SOLVE_VIEWS,
        NotEnoughViewsSnafu { got: used.len() }
    );

    let refs: Vec<_> = used.iter().map(|&i| &views[i]).collect();
    let problem = BundleProblem::new(&refs, image_size);
    let state = BundleState {
        params: start.to_params(),
        poses,
    };

    let (solved, report) = LevenbergMarquardt::new(*opts).minimize(&problem, state)?;
    trace!(?report, "refinement finished");

    if report.termination == Termination::IterationLimit && report.last_decrease > CONVERGED_DECREASE {
        return NotConvergedSnafu {
            iterations: report.iterations,
        }
        .fail();
    }
    ensure!(
        report.final_cost.points > 0 && report.final_cost.is_finite(),
        NonFiniteSnafu
    );

    let mut intrinsics = CameraIntrinsics::from_params(image_size, &solved.params);
    ensure!(intrinsics.to_params().iter().all(|v| v.is_finite()), NonFiniteSnafu);
    let inside = |c: f64, len: u32| (0.0..=len as f64).contains(&c);
    ensure!(
        intrinsics.fx > 0.0
            && intrinsics.fy > 0.0
            && inside(intrinsics.cx, image_size.width)
            && inside(intrinsics.cy, image_size.height),
        NonPhysicalSnafu {
            fx: intrinsics.fx,
            fy: intrinsics.fy,
            cx: intrinsics.cx,
            cy: intrinsics.cy,
        }
    );
    intrinsics.valid = true;

    let rms = (report.final_cost.sum_sq / report.final_cost.points as f64).sqrt();

    let mut all_poses = vec![None; views.len()];
    for (&i, pose) in used.iter().zip(solved.poses) {
        all_poses[i] = Some(pose);
    }

    Ok(Calibration {
        intrinsics,
        rms,
        poses: all_poses,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        camera::{project, Distortion},
        correspondence::Correspondence,
    };
    use anyhow::Result;
    use nalgebra::{Point3, Translation3, UnitQuaternion};

    fn truth() -> CameraIntrinsics {
        CameraIntrinsics {
            image_size: ImageSize::new(1280, 960),
            fx: 910.0,
            fy: 905.0,
            cx: 652.0,
            cy: 468.0,
            distortion: Distortion {
                k1: -0.08,
                k2: 0.02,
                p1: 0.0,
                p2: 0.0,
                k3: 0.0,
            },
            valid: true,
        }
    }

    fn view(k: &CameraIntrinsics, rx: f64, ry: f64, noise: &mut fastrand::Rng) -> ViewCorrespondences {
        let pose = Pose::from_parts(
            Translation3::new(0.0, 0.0, 0.5),
            UnitQuaternion::from_euler_angles(rx, ry, 0.0),
        );
        ViewCorrespondences {
            pairs: (0..7)
                .flat_map(|i| (0..5).map(move |j| Point3::new(i as f64 * 0.03 - 0.09, j as f64 * 0.03 - 0.06, 0.0)))
                .map(|board| {
                    let mut image = project(&board, &pose, k).unwrap();
                    image.x += (noise.f64() - 0.5) * 0.1;
                    image.y += (noise.f64() - 0.5) * 0.1;
                    Correspondence { image, board }
                })
                .collect(),
            markers: 3,
        }
    }

    fn views() -> Vec<ViewCorrespondences> {
        let mut rng = fastrand::Rng::with_seed(42);
        let k = truth();
        [(0.3, 0.0), (-0.3, 0.1), (0.0, 0.3), (0.1, -0.3), (-0.2, -0.2)]
            .iter()
            .map(|&(rx, ry)| view(&k, rx, ry, &mut rng))
            .collect()
    }

    #[test]
    fn calibrates_synthetic_views() -> Result<()> {
        let cal = calibrate(&views(), truth().image_size, None, &SolveOptions::default())?;

        assert!(cal.intrinsics.valid);
        assert!(cal.rms < 0.1, "rms = {}", cal.rms);
        assert!((cal.intrinsics.fx - 910.0).abs() < 5.0, "{:?}", cal.intrinsics);
        assert!((cal.intrinsics.fy - 905.0).abs() < 5.0, "{:?}", cal.intrinsics);
        assert!(cal.poses.iter().all(Option::is_some));

        Ok(())
    }

    #[test]
    fn empty_views_are_left_out() -> Result<()> {
        let mut input = views();
        input.insert(1, ViewCorrespondences::default());
        let cal = calibrate(&input, truth().image_size, None, &SolveOptions::default())?;

        assert_eq!(cal.poses.len(), 6);
        assert!(cal.poses[1].is_none());
        assert!(cal.poses.iter().filter(|p| p.is_some()).count() == 5);

        Ok(())
    }

    #[test]
    fn warm_start_from_prior() -> Result<()> {
        let mut prior = truth();
        prior.fx += 20.0;
        prior.distortion = Distortion::zeros();
        let cal = calibrate(&views(), prior.image_size, Some(&prior), &SolveOptions::default())?;

        assert!((cal.intrinsics.fx - 910.0).abs() < 5.0);
        Ok(())
    }

    #[test]
    fn too_few_views() {
        let v = views();
        assert_eq!(
            calibrate(&v[..2], truth().image_size, None, &SolveOptions::default()),
            Err(SolveError::NotEnoughViews { got: 2 })
        );
    }

    #[test]
    fn divergence_is_reported() {
        let opts = SolveOptions {
            max_iterations: 1,
            ..SolveOptions::default()
        };
        let mut prior = truth();
        prior.fx = 600.0;
        prior.fy = 1300.0;

        let err = calibrate(&views(), prior.image_size, Some(&prior), &opts).unwrap_err();
        assert_eq!(err, SolveError::NotConverged { iterations: 1 });
    }

    #[test]
    fn options_from_config() {
        let cfg = SolverCfg {
            max_iterations: 7,
            ..SolverCfg::default()
        };
        let opts = SolveOptions::from(&cfg);
        assert_eq!(opts.max_iterations, 7);
        assert_eq!(opts.ftol, SolveOptions::default().ftol);
    }
}
