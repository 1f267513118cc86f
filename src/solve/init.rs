//!
//! Linear initialization: focal length seed and per-view board poses
//!

use nalgebra::{
    Matrix2, Matrix3, Matrix3xX, Point2, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3,
};

use super::{homography::dlt_homography, SolveError};
use crate::{
    camera::{CameraIntrinsics, ImageSize, Pose},
    correspondence::ViewCorrespondences,
};

/// Accepted range of the closed-form focal estimate, relative to the seed
const FOCAL_RANGE: (f64, f64) = (0.1, 10.0);

/// Orthonormal frame of the plane through a view's board points
///
/// Maps plane coordinates `(x, y, 0)` to board coordinates.
fn plane_frame(view: &ViewCorrespondences) -> Result<Pose, SolveError> {
    let n = view.len();
    let degenerate = |reason: &str| SolveError::DegenerateView {
        reason: reason.to_owned(),
    };
    if n < 4 {
        return Err(degenerate("fewer than 4 board points"));
    }

    let centroid = view
        .pairs
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.board.coords)
        / n as f64;
    let centered = Matrix3xX::from_iterator(
        n,
        view.pairs.iter().flat_map(|p| {
            let d = p.board.coords - centroid;
            [d.x, d.y, d.z]
        }),
    );

    let svd = centered.svd(true, false);
    let u = svd.u.ok_or_else(|| degenerate("plane fit failed"))?;
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    if svd.singular_values[order[1]] <= f64::EPSILON * svd.singular_values[order[0]].max(1.0) {
        return Err(degenerate("board points are collinear"));
    }

    let e1: Vector3<f64> = u.column(order[0]).into_owned();
    let e2: Vector3<f64> = u.column(order[1]).into_owned();
    let e3 = e1.cross(&e2);
    let rot = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[e1, e2, e3]));

    Ok(Pose::from_parts(
        Translation3::from(centroid),
        UnitQuaternion::from_rotation_matrix(&rot),
    ))
}

/// Board points of a view expressed in its plane frame
fn plane_points(view: &ViewCorrespondences, frame: &Pose) -> Vec<Point2<f64>> {
    view.pairs
        .iter()
        .map(|p| frame.inverse_transform_point(&p.board).xy())
        .collect()
}

/// Decompose a plane-to-normalized-image homography into the plane's pose
fn pose_from_homography(h: &Matrix3<f64>) -> Result<Pose, SolveError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = (h1.norm() + h2.norm()) * 0.5;
    if !(norm > f64::EPSILON) {
        return Err(SolveError::DegenerateView {
            reason: "homography has no scale".to_owned(),
        });
    }
    // the board must end up in front of the camera
    let lambda = if h3.z < 0.0 { -1.0 / norm } else { 1.0 / norm };

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let r_mat = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);

    // Project onto SO(3)
    let svd = r_mat.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(SolveError::Singular);
    };
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    Ok(Pose::from_parts(
        Translation3::from(t),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth)),
    ))
}

/// Linear estimate of the board pose in one view, given intrinsics
pub fn estimate_view_pose(
    view: &ViewCorrespondences,
    intrinsics: &CameraIntrinsics,
) -> Result<Pose, SolveError> {
    let frame = plane_frame(view)?;
    let src = plane_points(view, &frame);
    let dst: Vec<_> = view
        .pairs
        .iter()
        .map(|p| Point2::from(intrinsics.normalize(&p.image)))
        .collect();

    let h = dlt_homography(&src, &dst)?;
    let camera_from_plane = pose_from_homography(&h)?;

    Ok(camera_from_plane * frame.inverse())
}

/// Starting intrinsics for a solve without a prior
///
/// The principal point sits at the image centre and distortion is zero. The focal length
/// starts from the image size and is replaced by the closed-form estimate from the views'
/// homographies (orthogonality of the plane axes, principal point held fixed) when that
/// estimate is usable.
pub fn initial_intrinsics(views: &[&ViewCorrespondences], image_size: ImageSize) -> CameraIntrinsics {
    let seed = CameraIntrinsics::uncalibrated(image_size);
    let to_center = Matrix3::new(1.0, 0.0, -seed.cx, 0.0, 1.0, -seed.cy, 0.0, 0.0, 1.0);

    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for view in views {
        let Ok(frame) = plane_frame(view) else {
            continue;
        };
        let src = plane_points(view, &frame);
        let dst: Vec<_> = view.pairs.iter().map(|p| p.image).collect();
        let Ok(h) = dlt_homography(&src, &dst) else {
            continue;
        };

        let hc = to_center * h;
        let hc = hc / hc.norm();
        let (h1, h2) = (hc.column(0).into_owned(), hc.column(1).into_owned());

        let rows = [
            (
                Vector2::new(h1.x * h2.x, h1.y * h2.y),
                -(h1.z * h2.z),
            ),
            (
                Vector2::new(h1.x * h1.x - h2.x * h2.x, h1.y * h1.y - h2.y * h2.y),
                -(h1.z * h1.z - h2.z * h2.z),
            ),
        ];
        for (a, b) in rows {
            ata += a * a.transpose();
            atb += a * b;
        }
    }

    // fronto-parallel views leave the system rank deficient
    let eig = ata.symmetric_eigen().eigenvalues;
    if !(eig.min() > eig.max() * 1e-10) {
        return seed;
    }
    let Some(sol) = ata.try_inverse().map(|inv| inv * atb) else {
        return seed;
    };
    if !(sol.x > 0.0 && sol.y > 0.0) {
        return seed;
    }

    let (fx, fy) = (1.0 / sol.x.sqrt(), 1.0 / sol.y.sqrt());
    let (lo, hi) = (seed.fx * FOCAL_RANGE.0, seed.fx * FOCAL_RANGE.1);
    if fx.is_finite() && fy.is_finite() && (lo..=hi).contains(&fx) && (lo..=hi).contains(&fy) {
        CameraIntrinsics { fx, fy, ..seed }
    } else {
        seed
    }
}
