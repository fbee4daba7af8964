//! Per-view pose initialization and refinement.
//!
//! A board pose is seeded from a plane-to-plane homography between the
//! target and the undistorted unit-focal image plane, then polished by a
//! small Levenberg-Marquardt solve over the 6 rigid parameters using the
//! full fisheye projection.

use fisheyecal_core::{rotation_from_rvec, CameraIntrinsics, FisheyeDistortion, Pose};
use nalgebra::{DMatrix, Matrix3, Matrix6, Point2, Point3, Vector3, Vector6};

use crate::project::{project_board_point, undistort_points};
use crate::{CalibError, Result};

/// Isotropic Hartley normalization: zero mean, mean distance sqrt(2).
fn normalize_points(points: &[Point2<f64>]) -> Result<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return Err(CalibError::DegenerateGeometry(
            "cannot normalize an empty point set".to_string(),
        ));
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -mean_x * scale,
        0.0,
        scale,
        -mean_y * scale,
        0.0,
        0.0,
        1.0,
    );
    Ok((normalized, t))
}

/// DLT homography from the board plane (x, y of the object points) to
/// the undistorted image plane.
fn homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(CalibError::InsufficientData(
            "homography needs at least 4 paired points".to_string(),
        ));
    }

    let (src_n, ts) = normalize_points(src)?;
    let (dst_n, td) = normalize_points(dst)?;

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let x = src_n[i].x;
        let y = src_n[i].y;
        let u = dst_n[i].x;
        let v = dst_n[i].y;
        let r0 = 2 * i;
        let r1 = r0 + 1;
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

    let svd = a.svd(true, true);
    let sv = &svd.singular_values;
    let rank_gap = sv[sv.len() - 2];
    if sv[0] <= 1e-12 || rank_gap / sv[0] < 1e-10 {
        return Err(CalibError::DegenerateGeometry(
            "board correspondences do not determine a unique homography".to_string(),
        ));
    }
    let vt = svd.v_t.ok_or_else(|| {
        CalibError::DegenerateGeometry("SVD failed in homography estimation".to_string())
    })?;
    let h = vt.row(vt.nrows() - 1);
    let hn = Matrix3::new(
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(0, 3)],
        h[(0, 4)],
        h[(0, 5)],
        h[(0, 6)],
        h[(0, 7)],
        h[(0, 8)],
    );

    let td_inv = td.try_inverse().ok_or_else(|| {
        CalibError::DegenerateGeometry("singular normalization transform".to_string())
    })?;
    let mut out = td_inv * hn * ts;
    if out[(2, 2)].abs() > 1e-12 {
        out /= out[(2, 2)];
    }
    Ok(out)
}

/// Decompose a board-to-normalized-plane homography into a rigid pose.
fn pose_from_homography(h: &Matrix3<f64>) -> Result<Pose> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = h1.norm();
    if norm < 1e-12 || !norm.is_finite() {
        return Err(CalibError::DegenerateGeometry(
            "rank-deficient homography: board view does not constrain a pose".to_string(),
        ));
    }
    let mut scale = 1.0 / norm;
    // Board must sit in front of the camera.
    if h3.z * scale < 0.0 {
        scale = -scale;
    }

    let r1 = h1 * scale;
    let r2 = h2 * scale;
    let r3 = r1.cross(&r2);
    if r3.norm() < 1e-9 {
        return Err(CalibError::DegenerateGeometry(
            "homography columns are parallel: no rotation can be extracted".to_string(),
        ));
    }
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx.svd(true, true);
    let u = svd.u.ok_or_else(|| {
        CalibError::DegenerateGeometry("SVD failed in pose decomposition".to_string())
    })?;
    let vt = svd.v_t.ok_or_else(|| {
        CalibError::DegenerateGeometry("SVD failed in pose decomposition".to_string())
    })?;
    let mut r = u * vt;
    if r.determinant() < 0.0 {
        r = -r;
    }

    Ok(Pose::new(r, h3 * scale))
}

/// Initial pose of one board view from its observed corners.
///
/// The observed pixels are lifted to the unit-focal plane with the
/// current camera estimate, so the quality of the seed tracks the
/// quality of the intrinsics; the solver re-runs this as it iterates.
pub fn estimate_board_pose(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> Result<Pose> {
    let board2d: Vec<Point2<f64>> = object_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let normalized = undistort_points(image_points, intrinsics, distortion)?;
    let h = homography_dlt(&board2d, &normalized)?;
    let pose = pose_from_homography(&h)?;
    refine_board_pose(&pose, object_points, image_points, intrinsics, distortion, 10)
}

fn pose_params(pose: &Pose) -> Vector6<f64> {
    let rvec = pose.rvec();
    Vector6::new(
        rvec.x,
        rvec.y,
        rvec.z,
        pose.translation.x,
        pose.translation.y,
        pose.translation.z,
    )
}

fn params_pose(p: &Vector6<f64>) -> Pose {
    Pose::new(
        rotation_from_rvec(&Vector3::new(p[0], p[1], p[2])),
        Vector3::new(p[3], p[4], p[5]),
    )
}

fn reprojection_cost(
    pose: &Pose,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> f64 {
    object_points
        .iter()
        .zip(image_points.iter())
        .map(|(p3, p2)| {
            let pred = project_board_point(intrinsics, distortion, pose, p3);
            (pred.x - p2.x).powi(2) + (pred.y - p2.y).powi(2)
        })
        .sum()
}

/// Levenberg-Marquardt refinement of a single board pose with numeric
/// Jacobians over the 6 rigid parameters.
pub fn refine_board_pose(
    initial: &Pose,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    max_iters: usize,
) -> Result<Pose> {
    if object_points.len() != image_points.len() || object_points.len() < 4 {
        return Err(CalibError::InsufficientData(
            "pose refinement needs >=4 paired points".to_string(),
        ));
    }

    let mut params = pose_params(initial);
    let mut lambda = 1e-3;
    let mut cost = reprojection_cost(
        &params_pose(&params),
        object_points,
        image_points,
        intrinsics,
        distortion,
    );

    for _ in 0..max_iters {
        let base = params_pose(&params);
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();

        let eps = 1e-7;
        for (p3, p2) in object_points.iter().zip(image_points.iter()) {
            let pred0 = project_board_point(intrinsics, distortion, &base, p3);
            let mut jac = [[0.0f64; 6]; 2];
            for k in 0..6 {
                let mut perturbed = params;
                perturbed[k] += eps;
                let pred1 =
                    project_board_point(intrinsics, distortion, &params_pose(&perturbed), p3);
                jac[0][k] = (pred1.x - pred0.x) / eps;
                jac[1][k] = (pred1.y - pred0.y) / eps;
            }
            let rx = pred0.x - p2.x;
            let ry = pred0.y - p2.y;
            for r in 0..6 {
                jtr[r] += jac[0][r] * rx + jac[1][r] * ry;
                for c in 0..6 {
                    jtj[(r, c)] += jac[0][r] * jac[0][c] + jac[1][r] * jac[1][c];
                }
            }
        }

        let mut accepted = false;
        for _ in 0..5 {
            let mut damped = jtj;
            for i in 0..6 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(delta) = damped.lu().solve(&jtr) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = params - delta;
            let new_cost = reprojection_cost(
                &params_pose(&candidate),
                object_points,
                image_points,
                intrinsics,
                distortion,
            );
            if new_cost.is_finite() && new_cost < cost {
                params = candidate;
                cost = new_cost;
                lambda = (lambda * 0.1).max(1e-12);
                accepted = true;
                if delta.norm() < 1e-10 {
                    return Ok(params_pose(&params));
                }
                break;
            }
            lambda *= 10.0;
        }
        if !accepted {
            break;
        }
    }

    Ok(params_pose(&params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for row in 0..6 {
            for col in 0..9 {
                pts.push(Point3::new(col as f64 * 0.02, row as f64 * 0.02, 0.0));
            }
        }
        pts
    }

    #[test]
    fn recovers_synthetic_pose() {
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480);
        let d = FisheyeDistortion::new(-0.01, 0.002, 0.0, 0.0);
        let truth = Pose::from_rvec_tvec(
            &Vector3::new(0.2, -0.3, 0.1),
            &Vector3::new(-0.05, 0.04, 0.6),
        );

        let obj = grid_points();
        let img: Vec<Point2<f64>> = obj
            .iter()
            .map(|p| project_board_point(&k, &d, &truth, p))
            .collect();

        let pose = estimate_board_pose(&obj, &img, &k, &d).unwrap();
        assert!((pose.translation - truth.translation).norm() < 1e-6);
        assert!((pose.rotation - truth.rotation).norm() < 1e-6);
    }

    #[test]
    fn coincident_points_are_degenerate() {
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480);
        let d = FisheyeDistortion::none();
        let obj = grid_points();
        let img = vec![Point2::new(100.0, 100.0); obj.len()];
        let err = estimate_board_pose(&obj, &img, &k, &d).unwrap_err();
        assert!(matches!(err, CalibError::DegenerateGeometry(_)));
    }
}
