use nalgebra::{DMatrix, Matrix3, Point2};

use super::SolveError;

/// Similarity that moves the centroid to the origin and scales the mean distance to sqrt(2)
fn normalizing_transform(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Point2::origin(), |acc, p| acc + p.coords / n);
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if !(mean_dist > f64::EPSILON) {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    Point2::new(
        t[(0, 0)] * p.x + t[(0, 2)],
        t[(1, 1)] * p.y + t[(1, 2)],
    )
}

/// Estimate `H` such that `dst ~ H src`, using the normalized DLT
pub fn dlt_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>, SolveError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(SolveError::DegenerateView {
            reason: format!("need at least 4 point pairs for a homography, got {n}"),
        });
    }

    let degenerate = || SolveError::DegenerateView {
        reason: "points are coincident".to_owned(),
    };
    let t_src = normalizing_transform(src).ok_or_else(degenerate)?;
    let t_dst = normalizing_transform(dst).ok_or_else(degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n.max(5), 9);
    for (i, (ps, pd)) in src.iter().zip(dst).enumerate() {
        let s = apply(&t_src, ps);
        let d = apply(&t_dst, pd);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Solve A h = 0 via SVD (smallest singular value); the zero rows padding a minimal
    // set keep A at least as tall as it is wide.
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(SolveError::Singular)?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &s)| if s < best.1 { (i, s) } else { best });
    let h = v_t.row(min_idx);

    let h_norm = Matrix3::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);
    let t_dst_inv = t_dst.try_inverse().ok_or(SolveError::Singular)?;
    let mut h_mat = t_dst_inv * h_norm * t_src;

    // normalize such that H[2,2] = 1
    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    } else {
        h_mat /= h_mat.norm();
    }

    if h_mat.iter().all(|v| v.is_finite()) {
        Ok(h_mat)
    } else {
        Err(SolveError::NonFinite)
    }
}
