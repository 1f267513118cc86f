//!
//! Joint refinement of intrinsics and per-view board poses
//!

use nalgebra::{DVector, Matrix3, Point3, SMatrix, SVector, Translation3, UnitQuaternion, Vector2, Vector3};

use super::lm::{damping_floor, Cost, LeastSquaresProblem, NormalEquations};
use crate::{
    camera::{project_camera_point, project_with_jacobian, CameraIntrinsics, ImageSize, Pose, NUM_INTRINSICS},
    correspondence::ViewCorrespondences,
};

/// Parameters per view: rotation increment then translation increment
const POSE_DOF: usize = 6;

/// Intrinsic parameters plus one board pose per view
#[derive(Debug, Clone, PartialEq)]
pub struct BundleState {
    pub params: [f64; NUM_INTRINSICS],
    pub poses: Vec<Pose>,
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

fn damped<const N: usize>(a: &SMatrix<f64, N, N>, lambda: f64, floor: f64) -> SMatrix<f64, N, N> {
    let mut d = *a;
    for i in 0..N {
        d[(i, i)] += lambda * a[(i, i)].max(floor);
    }
    d
}

/// One view's blocks of the normal equations
#[derive(Debug, Clone)]
struct PoseBlock {
    a_ip: SMatrix<f64, NUM_INTRINSICS, POSE_DOF>,
    a_pp: SMatrix<f64, POSE_DOF, POSE_DOF>,
    g_p: SVector<f64, POSE_DOF>,
}

/// Normal equations of the bundle, kept in block form
///
/// Poses only couple through the intrinsics, so `J^T J` is an arrowhead matrix. Damped
/// steps eliminate the pose blocks and solve a reduced system over the intrinsics, which
/// keeps memory and time per step linear in the number of views.
#[derive(Debug, Clone)]
pub struct BundleEquations {
    a_ii: SMatrix<f64, NUM_INTRINSICS, NUM_INTRINSICS>,
    g_i: SVector<f64, NUM_INTRINSICS>,
    blocks: Vec<PoseBlock>,
    cost: Cost,
    floor: f64,
}
impl NormalEquations for BundleEquations {
    fn cost(&self) -> Cost {
        self.cost
    }

    fn gradient_max(&self) -> f64 {
        self.blocks
            .iter()
            .map(|b| b.g_p.amax())
            .fold(self.g_i.amax(), f64::max)
    }

    fn solve_damped(&self, lambda: f64) -> Option<DVector<f64>> {
        let mut reduced = damped(&self.a_ii, lambda, self.floor);
        let mut rhs = -self.g_i;
        let mut inverses = Vec::with_capacity(self.blocks.len());

        for block in &self.blocks {
            let inv = damped(&block.a_pp, lambda, self.floor).cholesky()?.inverse();
            let w = block.a_ip * inv;
            reduced -= w * block.a_ip.transpose();
            rhs += w * block.g_p;
            inverses.push(inv);
        }

        let d_i = reduced.cholesky()?.solve(&rhs);

        let mut delta = DVector::zeros(NUM_INTRINSICS + POSE_DOF * self.blocks.len());
        delta.fixed_rows_mut::<NUM_INTRINSICS>(0).copy_from(&d_i);
        for (v, (block, inv)) in self.blocks.iter().zip(&inverses).enumerate() {
            let d_p = inv * (-block.g_p - block.a_ip.transpose() * d_i);
            delta
                .fixed_rows_mut::<POSE_DOF>(NUM_INTRINSICS + POSE_DOF * v)
                .copy_from(&d_p);
        }

        Some(delta)
    }
}

/// Reprojection residuals of every view's correspondences
pub struct BundleProblem<'a> {
    views: &'a [&'a ViewCorrespondences],
    image_size: ImageSize,
}
impl<'a> BundleProblem<'a> {
    pub fn new(views: &'a [&'a ViewCorrespondences], image_size: ImageSize) -> Self {
        Self { views, image_size }
    }

    pub fn num_params(&self) -> usize {
        NUM_INTRINSICS + POSE_DOF * self.views.len()
    }

    /// Per-view root mean square reprojection error
    pub fn view_rms(&self, state: &BundleState) -> Vec<f64> {
        let intrinsics = CameraIntrinsics::from_params(self.image_size, &state.params);
        self.views
            .iter()
            .zip(&state.poses)
            .map(|(view, pose)| {
                let (sum, n) = view
                    .pairs
                    .iter()
                    .filter_map(|p| {
                        project_camera_point(&pose.transform_point(&p.board), &intrinsics)
                            .ok()
                            .map(|px| (px - p.image).norm_squared())
                    })
                    .fold((0.0, 0usize), |(s, n), e| (s + e, n + 1));
                if n == 0 {
                    f64::INFINITY
                } else {
                    (sum / n as f64).sqrt()
                }
            })
            .collect()
    }
}

impl LeastSquaresProblem for BundleProblem<'_> {
    type State = BundleState;
    type Equations = BundleEquations;

    fn cost(&self, state: &BundleState) -> Cost {
        let intrinsics = CameraIntrinsics::from_params(self.image_size, &state.params);
        let mut cost = Cost {
            sum_sq: 0.0,
            points: 0,
        };

        for (view, pose) in self.views.iter().zip(&state.poses) {
            for pair in &view.pairs {
                if let Ok(px) = project_camera_point(&pose.transform_point(&pair.board), &intrinsics) {
                    cost.sum_sq += (px - pair.image).norm_squared();
                    cost.points += 1;
                }
            }
        }

        cost
    }

    fn normal_equations(&self, state: &BundleState) -> BundleEquations {
        let mut cost = Cost {
            sum_sq: 0.0,
            points: 0,
        };
        let mut a_ii = SMatrix::<f64, NUM_INTRINSICS, NUM_INTRINSICS>::zeros();
        let mut g_i = SVector::<f64, NUM_INTRINSICS>::zeros();
        let mut blocks = Vec::with_capacity(self.views.len());

        for (view, pose) in self.views.iter().zip(&state.poses) {
            let mut block = PoseBlock {
                a_ip: SMatrix::zeros(),
                a_pp: SMatrix::zeros(),
                g_p: SVector::zeros(),
            };

            for pair in &view.pairs {
                let rotated = pose.rotation * pair.board.coords;
                let pc = Point3::from(rotated + pose.translation.vector);
                let Ok(proj) = project_with_jacobian(&pc, &state.params) else {
                    continue;
                };

                let r: Vector2<f64> = proj.pixel - pair.image;
                cost.sum_sq += r.norm_squared();
                cost.points += 1;

                let j_i = proj.d_intrinsics;
                let mut j_p = SMatrix::<f64, 2, POSE_DOF>::zeros();
                j_p.fixed_view_mut::<2, 3>(0, 0)
                    .copy_from(&(proj.d_point * -skew(&rotated)));
                j_p.fixed_view_mut::<2, 3>(0, 3).copy_from(&proj.d_point);

                a_ii += j_i.transpose() * j_i;
                block.a_ip += j_i.transpose() * j_p;
                block.a_pp += j_p.transpose() * j_p;
                g_i += j_i.transpose() * r;
                block.g_p += j_p.transpose() * r;
            }

            blocks.push(block);
        }

        let max_diag = blocks
            .iter()
            .map(|b| b.a_pp.diagonal().max())
            .fold(a_ii.diagonal().max(), f64::max);

        BundleEquations {
            a_ii,
            g_i,
            blocks,
            cost,
            floor: damping_floor(max_diag),
        }
    }

    fn retract(&self, state: &BundleState, delta: &DVector<f64>) -> BundleState {
        let mut params = state.params;
        for (p, d) in params.iter_mut().zip(delta.iter()) {
            *p += d;
        }

        let poses = state
            .poses
            .iter()
            .enumerate()
            .map(|(v, pose)| {
                let o = NUM_INTRINSICS + POSE_DOF * v;
                let omega = Vector3::new(delta[o], delta[o + 1], delta[o + 2]);
                let dt = Vector3::new(delta[o + 3], delta[o + 4], delta[o + 5]);

                Pose::from_parts(
                    Translation3::from(pose.translation.vector + dt),
                    UnitQuaternion::from_scaled_axis(omega) * pose.rotation,
                )
            })
            .collect();

        BundleState { params, poses }
    }

    fn norm(&self, state: &BundleState) -> f64 {
        let intrinsics: f64 = state.params.iter().map(|p| p * p).sum();
        let translations: f64 = state
            .poses
            .iter()
            .map(|p| p.translation.vector.norm_squared())
            .sum();

        (intrinsics + translations).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        camera::{project, Distortion},
        correspondence::Correspondence,
        solve::{
            lm::{DenseEquations, LevenbergMarquardt},
            SolveOptions,
        },
    };
    use nalgebra::DMatrix;

    /// The full `J^T J` and `J^T r` the blocks stand for
    fn dense(eqs: &BundleEquations) -> DenseEquations {
        let n = NUM_INTRINSICS + POSE_DOF * eqs.blocks.len();
        let mut jtj = DMatrix::zeros(n, n);
        let mut jtr = DVector::zeros(n);

        jtj.fixed_view_mut::<NUM_INTRINSICS, NUM_INTRINSICS>(0, 0)
            .copy_from(&eqs.a_ii);
        jtr.fixed_rows_mut::<NUM_INTRINSICS>(0).copy_from(&eqs.g_i);
        for (v, block) in eqs.blocks.iter().enumerate() {
            let o = NUM_INTRINSICS + POSE_DOF * v;
            jtj.fixed_view_mut::<NUM_INTRINSICS, POSE_DOF>(0, o)
                .copy_from(&block.a_ip);
            jtj.fixed_view_mut::<POSE_DOF, NUM_INTRINSICS>(o, 0)
                .copy_from(&block.a_ip.transpose());
            jtj.fixed_view_mut::<POSE_DOF, POSE_DOF>(o, o)
                .copy_from(&block.a_pp);
            jtr.fixed_rows_mut::<POSE_DOF>(o).copy_from(&block.g_p);
        }

        DenseEquations {
            jtj,
            jtr,
            cost: eqs.cost,
        }
    }

    fn truth() -> CameraIntrinsics {
        CameraIntrinsics {
            image_size: ImageSize::new(1280, 960),
            fx: 905.0,
            fy: 895.0,
            cx: 648.0,
            cy: 472.0,
            distortion: Distortion {
                k1: -0.12,
                k2: 0.05,
                p1: 0.001,
                p2: -0.0005,
                k3: 0.0,
            },
            valid: true,
        }
    }

    fn views(k: &CameraIntrinsics, poses: &[Pose]) -> Vec<ViewCorrespondences> {
        poses
            .iter()
            .map(|pose| ViewCorrespondences {
                pairs: (0..8)
                    .flat_map(|i| (0..6).map(move |j| Point3::new(i as f64 * 0.025 - 0.09, j as f64 * 0.025 - 0.06, 0.0)))
                    .map(|board| Correspondence {
                        image: project(&board, pose, k).unwrap(),
                        board,
                    })
                    .collect(),
                markers: 4,
            })
            .collect()
    }

    fn poses() -> Vec<Pose> {
        [(0.3, 0.1), (-0.3, 0.2), (0.15, -0.3), (-0.2, -0.25), (0.05, 0.35)]
            .iter()
            .map(|&(rx, ry)| {
                Pose::from_parts(
                    Translation3::new(0.0, 0.01, 0.45),
                    UnitQuaternion::from_euler_angles(rx, ry, 0.05),
                )
            })
            .collect()
    }

    #[test]
    fn normal_equations_match_numeric_gradient() {
        let k = truth();
        let data = views(&k, &poses()[..2]);
        let refs: Vec<_> = data.iter().collect();
        let problem = BundleProblem::new(&refs, k.image_size);

        let mut start = k.to_params();
        start[0] += 7.0;
        start[4] += 0.02;
        let state = BundleState {
            params: start,
            poses: poses()[..2].to_vec(),
        };

        let eqs = problem.normal_equations(&state);
        assert_eq!(eqs.blocks.len(), 2);
        assert_eq!(eqs.cost, problem.cost(&state));
        let jtr = dense(&eqs).jtr;
        assert_eq!(jtr.len(), problem.num_params());

        // gradient of cost / 2 is J^T r
        for i in 0..problem.num_params() {
            let h = 1e-6;
            let mut step = DVector::zeros(problem.num_params());
            step[i] = h;
            let plus = problem.cost(&problem.retract(&state, &step)).sum_sq;
            step[i] = -h;
            let minus = problem.cost(&problem.retract(&state, &step)).sum_sq;
            let numeric = (plus - minus) / (4.0 * h);

            let analytic = jtr[i];
            assert!(
                (numeric - analytic).abs() < 1e-3 * (1.0 + analytic.abs()),
                "param {i}: {numeric} vs {analytic}"
            );
        }
    }

    #[test]
    fn recovers_intrinsics_from_noisy_views() {
        let k = truth();
        let mut rng = fastrand::Rng::with_seed(7);
        let mut data = views(&k, &poses());
        for pair in data.iter_mut().flat_map(|v| v.pairs.iter_mut()) {
            pair.image.x += (rng.f64() - 0.5) * 0.2;
            pair.image.y += (rng.f64() - 0.5) * 0.2;
        }
        let refs: Vec<_> = data.iter().collect();
        let problem = BundleProblem::new(&refs, k.image_size);

        // perturbed start, as the linear initialization would give
        let mut start = k.to_params();
        start[0] *= 1.05;
        start[1] *= 0.96;
        start[2] += 10.0;
        start[3] -= 8.0;
        start[4] = 0.0;
        start[5] = 0.0;
        let state = BundleState {
            params: start,
            poses: poses()
                .iter()
                .map(|p| Pose::from_parts(Translation3::from(p.translation.vector * 1.03), UnitQuaternion::from_euler_angles(0.01, -0.01, 0.0) * p.rotation))
                .collect(),
        };

        let (solved, report) = LevenbergMarquardt::new(SolveOptions::default())
            .minimize(&problem, state)
            .unwrap();
        let rms = (report.final_cost.sum_sq / report.final_cost.points as f64).sqrt();

        assert!(rms < 0.1, "rms = {rms}");
        assert!((solved.params[0] - k.fx).abs() < 5.0, "fx = {}", solved.params[0]);
        assert!((solved.params[1] - k.fy).abs() < 5.0, "fy = {}", solved.params[1]);
        assert!((solved.params[2] - k.cx).abs() < 5.0, "cx = {}", solved.params[2]);
        assert!((solved.params[3] - k.cy).abs() < 5.0, "cy = {}", solved.params[3]);
        for v in problem.view_rms(&solved) {
            assert!(v < 3.0 * rms + 1e-9);
        }
    }

    #[test]
    fn reduced_step_matches_dense_step() {
        let k = truth();
        let data = views(&k, &poses());
        let refs: Vec<_> = data.iter().collect();
        let problem = BundleProblem::new(&refs, k.image_size);

        let mut start = k.to_params();
        start[0] += 12.0;
        start[3] -= 4.0;
        start[5] = 0.0;
        let state = BundleState {
            params: start,
            poses: poses()
                .iter()
                .map(|p| Pose::from_parts(Translation3::from(p.translation.vector * 0.98), p.rotation))
                .collect(),
        };

        let eqs = problem.normal_equations(&state);
        let full = dense(&eqs);
        assert_eq!(eqs.gradient_max(), full.gradient_max());

        for lambda in [1e-6, 1e-3, 1.0, 1e3] {
            let reduced = eqs.solve_damped(lambda).unwrap();
            let reference = full.solve_damped(lambda).unwrap();
            assert_eq!(reduced.len(), problem.num_params());
            let err = (&reduced - &reference).amax();
            assert!(
                err <= 1e-6 * (1.0 + reference.amax()),
                "lambda {lambda}: {err} off a step of {}",
                reference.amax()
            );
        }
    }

    #[test]
    fn solves_hundreds_of_views() {
        let k = truth();
        let poses: Vec<_> = (0..400)
            .map(|i| {
                let i = i as f64;
                Pose::from_parts(
                    Translation3::new(0.0, 0.01, 0.45 + 0.05 * (0.3 * i).sin()),
                    UnitQuaternion::from_euler_angles(0.3 * (1.7 * i).sin(), 0.3 * (2.3 * i).cos(), 0.05),
                )
            })
            .collect();
        let data = views(&k, &poses);
        let refs: Vec<_> = data.iter().collect();
        let problem = BundleProblem::new(&refs, k.image_size);

        let mut start = k.to_params();
        start[0] *= 1.02;
        start[1] *= 0.98;
        start[4] = 0.0;
        let state = BundleState { params: start, poses };

        let (solved, report) = LevenbergMarquardt::new(SolveOptions::default())
            .minimize(&problem, state)
            .unwrap();
        let rms = (report.final_cost.sum_sq / report.final_cost.points as f64).sqrt();

        assert_eq!(solved.poses.len(), 400);
        assert!(rms < 1e-3, "rms = {rms}");
        assert!((solved.params[0] - k.fx).abs() < 0.5, "fx = {}", solved.params[0]);
        assert!((solved.params[1] - k.fy).abs() < 0.5, "fy = {}", solved.params[1]);
    }
}
