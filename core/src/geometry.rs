use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole-part of the camera intrinsics: focal lengths, principal point
/// and the off-diagonal skew term of `K`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub skew: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
            width,
            height,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0,
        )
    }

    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        self.matrix().try_inverse().unwrap_or(Matrix3::identity())
    }

    /// Pixel coordinates of a point on the unit-focal image plane.
    pub fn to_pixel(&self, x: f64, y: f64) -> Point2<f64> {
        Point2::new(
            self.fx * x + self.skew * y + self.cx,
            self.fy * y + self.cy,
        )
    }
}

/// Rigid transform placing the calibration target in the camera frame.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_rvec_tvec(rvec: &Vector3<f64>, tvec: &Vector3<f64>) -> Self {
        Self {
            rotation: rotation_from_rvec(rvec),
            translation: *tvec,
        }
    }

    pub fn rvec(&self) -> Vector3<f64> {
        rvec_from_rotation(&self.rotation)
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * point.coords + self.translation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Rodrigues: axis-angle vector to rotation matrix.
pub fn rotation_from_rvec(rvec: &Vector3<f64>) -> Matrix3<f64> {
    let theta = rvec.norm();
    if theta < 1e-12 {
        return Matrix3::identity();
    }
    let axis = rvec / theta;
    let k = skew_symmetric(&axis);
    Matrix3::identity() + theta.sin() * k + (1.0 - theta.cos()) * (k * k)
}

/// Rodrigues: rotation matrix to axis-angle vector.
pub fn rvec_from_rotation(r: &Matrix3<f64>) -> Vector3<f64> {
    let cos_theta = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();
    if theta < 1e-12 {
        return Vector3::zeros();
    }

    let v = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );

    if theta < std::f64::consts::PI - 1e-6 {
        return v * (theta / (2.0 * theta.sin()));
    }

    // Near pi the off-diagonal differences vanish; recover the axis from
    // the diagonal and pick signs from the symmetric part.
    let xx = ((r[(0, 0)] + 1.0) * 0.5).max(0.0).sqrt();
    let yy = ((r[(1, 1)] + 1.0) * 0.5).max(0.0).sqrt();
    let zz = ((r[(2, 2)] + 1.0) * 0.5).max(0.0).sqrt();
    let mut axis = Vector3::new(xx, yy, zz);
    if axis[0] >= axis[1] && axis[0] >= axis[2] {
        axis[1] = axis[1].copysign(r[(0, 1)] + r[(1, 0)]);
        axis[2] = axis[2].copysign(r[(0, 2)] + r[(2, 0)]);
    } else if axis[1] >= axis[2] {
        axis[0] = axis[0].copysign(r[(0, 1)] + r[(1, 0)]);
        axis[2] = axis[2].copysign(r[(1, 2)] + r[(2, 1)]);
    } else {
        axis[0] = axis[0].copysign(r[(0, 2)] + r[(2, 0)]);
        axis[1] = axis[1].copysign(r[(1, 2)] + r[(2, 1)]);
    }
    let n = axis.norm();
    if n < 1e-12 {
        return Vector3::zeros();
    }
    axis * (theta / n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rodrigues_roundtrip() {
        let rvec = Vector3::new(0.3, -0.2, 0.5);
        let r = rotation_from_rvec(&rvec);
        let back = rvec_from_rotation(&r);
        assert!((back - rvec).norm() < 1e-10);
    }

    #[test]
    fn rodrigues_identity() {
        let r = rotation_from_rvec(&Vector3::zeros());
        assert!((r - Matrix3::identity()).norm() < 1e-15);
        assert!(rvec_from_rotation(&Matrix3::identity()).norm() < 1e-15);
    }

    #[test]
    fn rodrigues_near_pi() {
        let rvec = Vector3::new(std::f64::consts::PI - 1e-8, 0.0, 0.0);
        let r = rotation_from_rvec(&rvec);
        let back = rvec_from_rotation(&r);
        let r2 = rotation_from_rvec(&back);
        assert!((r2 - r).norm() < 1e-6);
    }

    #[test]
    fn intrinsics_matrix_inverse() {
        let k = CameraIntrinsics::new(420.0, 415.0, 319.5, 239.5, 640, 480);
        let prod = k.matrix() * k.inverse_matrix();
        assert!((prod - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn pose_transforms_point() {
        let pose = Pose::from_rvec_tvec(
            &Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            &Vector3::new(1.0, 0.0, 0.0),
        );
        let p = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert!((p.x - 1.0).abs() < 1e-12);
        assert!((p.y - 1.0).abs() < 1e-12);
    }
}
