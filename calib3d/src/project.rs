//! Forward fisheye projection used by the solver and the tests.

use fisheyecal_core::{CameraIntrinsics, FisheyeDistortion, Pose};
use nalgebra::{Point2, Point3};

use crate::{CalibError, Result};

/// Project one target point into the image through the fisheye model.
///
/// The point is moved into the camera frame, its incidence angle is
/// distorted by the angle polynomial and the result is scaled through
/// the intrinsic matrix.
pub fn project_board_point(
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    pose: &Pose,
    point: &Point3<f64>,
) -> Point2<f64> {
    let pc = pose.rotation * point.coords + pose.translation;
    let r = (pc.x * pc.x + pc.y * pc.y).sqrt();
    let theta = r.atan2(pc.z);
    let (xd, yd) = if r > 1e-12 {
        let theta_d = distortion.distort_angle(theta);
        (theta_d * pc.x / r, theta_d * pc.y / r)
    } else {
        (0.0, 0.0)
    };
    intrinsics.to_pixel(xd, yd)
}

/// Project a full view of target points.
pub fn project_board_points(
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    pose: &Pose,
    points: &[Point3<f64>],
) -> Vec<Point2<f64>> {
    points
        .iter()
        .map(|p| project_board_point(intrinsics, distortion, pose, p))
        .collect()
}

/// Map observed pixels back to the unit-focal pinhole plane by removing
/// the intrinsic scaling and the angular distortion.
pub fn undistort_points(
    pixels: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> Result<Vec<Point2<f64>>> {
    if intrinsics.fx.abs() <= 1e-12 || intrinsics.fy.abs() <= 1e-12 {
        return Err(CalibError::InvalidConfiguration(
            "undistort_points requires non-zero focal lengths".to_string(),
        ));
    }

    let mut out = Vec::with_capacity(pixels.len());
    for p in pixels {
        let yd = (p.y - intrinsics.cy) / intrinsics.fy;
        let xd = (p.x - intrinsics.cx - intrinsics.skew * yd) / intrinsics.fx;
        let (xu, yu) = distortion.remove(xd, yd);
        out.push(Point2::new(xu, yu));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn principal_axis_point_hits_principal_point() {
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480);
        let d = FisheyeDistortion::none();
        let pose = Pose::default();
        let uv = project_board_point(&k, &d, &pose, &Point3::new(0.0, 0.0, 1.5));
        assert!((uv.x - 320.0).abs() < 1e-9);
        assert!((uv.y - 240.0).abs() < 1e-9);
    }

    #[test]
    fn project_then_undistort_recovers_pinhole_ray() {
        let k = CameraIntrinsics::new(420.0, 410.0, 319.0, 241.0, 640, 480);
        let d = FisheyeDistortion::new(-0.02, 0.004, -0.001, 0.0005);
        let pose = Pose::new(nalgebra::Matrix3::identity(), Vector3::new(0.0, 0.0, 2.0));

        let p = Point3::new(0.3, -0.2, 0.0);
        let uv = project_board_point(&k, &d, &pose, &p);
        let back = undistort_points(&[uv], &k, &d).unwrap();

        let pc = pose.transform_point(&p);
        assert!((back[0].x - pc.x / pc.z).abs() < 1e-8);
        assert!((back[0].y - pc.y / pc.z).abs() < 1e-8);
    }
}
