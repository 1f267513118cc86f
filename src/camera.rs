//!
//! Pinhole camera with 5-coefficient Brown-Conrady distortion
//!

use nalgebra::{Isometry3, Matrix2x3, Matrix3, Point2, Point3, SMatrix, Vector2};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Board-to-camera rigid transform
pub type Pose = Isometry3<f64>;

/// Jacobian of a pixel w.r.t. `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
pub type IntrinsicsJacobian = SMatrix<f64, 2, 9>;

/// Number of intrinsic parameters touched by the solver
pub const NUM_INTRINSICS: usize = 9;

/// Points closer than this to the camera plane cannot be projected
const MIN_DEPTH: f64 = 1e-9;

/// The point lies on or behind the camera plane
#[derive(Debug, Snafu, Clone, Copy, PartialEq)]
#[snafu(display("point is not projectable (depth {depth})"))]
pub struct NonProjectable {
    pub depth: f64,
}

/// Image size in pixels
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}
impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Geometric centre of the image
    pub fn center(&self) -> Point2<f64> {
        Point2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    pub fn diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Lens distortion coefficients, in OpenCV order `(k1, k2, p1, p2, k3)`
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}
impl Distortion {
    pub const fn zeros() -> Self {
        Self {
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
        }
    }

    pub const fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub const fn from_array(k: [f64; 5]) -> Self {
        Self {
            k1: k[0],
            k2: k[1],
            p1: k[2],
            p2: k[3],
            k3: k[4],
        }
    }

    /// Distort a point on the normalized image plane
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));

        Vector2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration
    ///
    /// Good enough for initialization; it does not converge for extreme distortion.
    pub fn undistort(&self, n_dist: &Vector2<f64>) -> Vector2<f64> {
        let mut n = *n_dist;
        for _ in 0..20 {
            let err = self.distort(&n) - n_dist;
            n -= err;
            if err.norm_squared() < 1e-24 {
                break;
            }
        }

        n
    }
}

/// Camera intrinsics: linear projection plus distortion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub image_size: ImageSize,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
    /// Set once the values come from a solve or a trusted prior
    #[serde(default)]
    pub valid: bool,
}
impl CameraIntrinsics {
    /// Uncalibrated placeholder for the given image size
    pub fn uncalibrated(image_size: ImageSize) -> Self {
        let c = image_size.center();
        let f = image_size.width.max(image_size.height) as f64;

        Self {
            image_size,
            fx: f,
            fy: f,
            cx: c.x,
            cy: c.y,
            distortion: Distortion::zeros(),
            valid: false,
        }
    }

    /// The 3x3 linear projection matrix (zero skew)
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Parameter vector `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
    pub fn to_params(&self) -> [f64; NUM_INTRINSICS] {
        let d = &self.distortion;
        [
            self.fx, self.fy, self.cx, self.cy, d.k1, d.k2, d.p1, d.p2, d.k3,
        ]
    }

    /// Inverse of [`CameraIntrinsics::to_params`]; the validity flag is left unset
    pub fn from_params(image_size: ImageSize, p: &[f64; NUM_INTRINSICS]) -> Self {
        Self {
            image_size,
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
            distortion: Distortion::from_array([p[4], p[5], p[6], p[7], p[8]]),
            valid: false,
        }
    }

    /// Every parameter is finite and both focal lengths are positive
    pub fn is_finite(&self) -> bool {
        self.to_params().iter().all(|v| v.is_finite()) && self.fx > 0.0 && self.fy > 0.0
    }

    /// Map a pixel to the normalized, undistorted image plane
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector2<f64> {
        let n = Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy);
        self.distortion.undistort(&n)
    }
}

/// Project a board point through `pose` and `intrinsics`
pub fn project(
    point: &Point3<f64>,
    pose: &Pose,
    intrinsics: &CameraIntrinsics,
) -> Result<Point2<f64>, NonProjectable> {
    project_camera_point(&pose.transform_point(point), intrinsics)
}

/// Project a point already expressed in the camera frame
pub fn project_camera_point(
    pc: &Point3<f64>,
    intrinsics: &CameraIntrinsics,
) -> Result<Point2<f64>, NonProjectable> {
    ensure!(pc.z > MIN_DEPTH, NonProjectableSnafu { depth: pc.z });

    let n = intrinsics
        .distortion
        .distort(&Vector2::new(pc.x / pc.z, pc.y / pc.z));

    Ok(Point2::new(
        intrinsics.fx * n.x + intrinsics.cx,
        intrinsics.fy * n.y + intrinsics.cy,
    ))
}

/// Projection of a camera-frame point together with its analytic derivatives
#[derive(Debug, Clone, Copy)]
pub struct ProjectionJacobian {
    pub pixel: Point2<f64>,
    /// d(pixel) / d(intrinsic parameters)
    pub d_intrinsics: IntrinsicsJacobian,
    /// d(pixel) / d(camera-frame point)
    pub d_point: Matrix2x3<f64>,
}

/// Like [`project_camera_point`], also returning the Jacobians the solver needs
pub fn project_with_jacobian(
    pc: &Point3<f64>,
    p: &[f64; NUM_INTRINSICS],
) -> Result<ProjectionJacobian, NonProjectable> {
    ensure!(pc.z > MIN_DEPTH, NonProjectableSnafu { depth: pc.z });

    let [fx, fy, cx, cy, k1, k2, p1, p2, k3] = *p;
    let inv_z = 1.0 / pc.z;
    let x = pc.x * inv_z;
    let y = pc.y * inv_z;

    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
    // d(radial) / d(r2)
    let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

    // distorted w.r.t. normalized
    let dxd_dx = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
    let dxd_dy = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
    let dyd_dx = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
    let dyd_dy = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

    #[rustfmt::skip]
    let d_intrinsics = IntrinsicsJacobian::from_row_slice(&[
        xd,  0.0, 1.0, 0.0, fx * x * r2, fx * x * r4, fx * 2.0 * x * y,       fx * (r2 + 2.0 * x * x), fx * x * r6,
        0.0, yd,  0.0, 1.0, fy * y * r2, fy * y * r4, fy * (r2 + 2.0 * y * y), fy * 2.0 * x * y,        fy * y * r6,
    ]);

    // normalized w.r.t. camera point
    #[rustfmt::skip]
    let dn_dpc = Matrix2x3::new(
        inv_z, 0.0,   -x * inv_z,
        0.0,   inv_z, -y * inv_z,
    );
    #[rustfmt::skip]
    let dpix_dn = nalgebra::Matrix2::new(
        fx * dxd_dx, fx * dxd_dy,
        fy * dyd_dx, fy * dyd_dy,
    );

    Ok(ProjectionJacobian {
        pixel: Point2::new(fx * xd + cx, fy * yd + cy),
        d_intrinsics,
        d_point: dpix_dn * dn_dpc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            image_size: ImageSize::new(1280, 960),
            fx: 910.0,
            fy: 890.0,
            cx: 650.0,
            cy: 470.0,
            distortion: Distortion {
                k1: -0.21,
                k2: 0.08,
                p1: 0.0015,
                p2: -0.0008,
                k3: -0.01,
            },
            valid: true,
        }
    }

    fn pose() -> Pose {
        Pose::from_parts(
            Translation3::new(0.02, -0.03, 0.6),
            UnitQuaternion::from_euler_angles(0.2, -0.15, 0.05),
        )
    }

    #[test]
    fn projection_without_distortion_is_pinhole() {
        let mut k = intrinsics();
        k.distortion = Distortion::zeros();

        let px = project(&Point3::new(0.1, -0.05, 0.0), &Pose::identity(), &k);
        assert!(px.is_err(), "point on the camera plane must not project");

        let pose = Pose::translation(0.0, 0.0, 2.0);
        let px = project(&Point3::new(0.1, -0.05, 0.0), &pose, &k).unwrap();
        assert!((px.x - (910.0 * 0.05 + 650.0)).abs() < 1e-9);
        assert!((px.y - (890.0 * -0.025 + 470.0)).abs() < 1e-9);
    }

    #[test]
    fn distortion_formula() {
        let d = intrinsics().distortion;
        let (x, y) = (0.3, -0.2);
        let r2: f64 = x * x + y * y;
        let radial = 1.0 + d.k1 * r2 + d.k2 * r2.powi(2) + d.k3 * r2.powi(3);
        let expected_x = x * radial + 2.0 * d.p1 * x * y + d.p2 * (r2 + 2.0 * x * x);
        let expected_y = y * radial + d.p1 * (r2 + 2.0 * y * y) + 2.0 * d.p2 * x * y;

        let n = d.distort(&Vector2::new(x, y));
        assert!((n.x - expected_x).abs() < 1e-15);
        assert!((n.y - expected_y).abs() < 1e-15);
    }

    #[test]
    fn behind_camera_is_not_projectable() {
        let pose = Pose::translation(0.0, 0.0, -1.0);
        let err = project(&Point3::origin(), &pose, &intrinsics()).unwrap_err();
        assert_eq!(err.depth, -1.0);
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = intrinsics().distortion;
        let n = Vector2::new(0.25, -0.18);
        let back = d.undistort(&d.distort(&n));
        assert!((back - n).norm() < 1e-10, "{back:?} vs {n:?}");

        let k = intrinsics();
        let px = project_camera_point(&Point3::new(0.25, -0.18, 1.0), &k).unwrap();
        assert!((k.normalize(&px) - n).norm() < 1e-10);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let k = intrinsics();
        let params = k.to_params();
        let pc = pose().transform_point(&Point3::new(0.07, 0.04, 0.0));

        let jac = project_with_jacobian(&pc, &params).unwrap();
        let px = project_camera_point(&pc, &k).unwrap();
        assert!((jac.pixel - px).norm() < 1e-12);

        for i in 0..NUM_INTRINSICS {
            let h = 1e-6 * params[i].abs().max(1e-3);
            let mut plus = params;
            let mut minus = params;
            plus[i] += h;
            minus[i] -= h;
            let fp = project_camera_point(&pc, &CameraIntrinsics::from_params(k.image_size, &plus)).unwrap();
            let fm = project_camera_point(&pc, &CameraIntrinsics::from_params(k.image_size, &minus)).unwrap();
            let numeric = (fp - fm) / (2.0 * h);
            let analytic = jac.d_intrinsics.column(i);
            assert!(
                (numeric - analytic).norm() < 1e-4 * (1.0 + analytic.norm()),
                "intrinsic {i}: {numeric:?} vs {analytic:?}"
            );
        }

        for i in 0..3 {
            let mut step = Vector3::zeros();
            step[i] = 1e-7;
            let fp = project_camera_point(&(pc + step), &k).unwrap();
            let fm = project_camera_point(&(pc - step), &k).unwrap();
            let numeric = (fp - fm) / 2e-7;
            let analytic = jac.d_point.column(i);
            assert!(
                (numeric - analytic).norm() < 1e-3 * (1.0 + analytic.norm()),
                "point {i}: {numeric:?} vs {analytic:?}"
            );
        }
    }
}
