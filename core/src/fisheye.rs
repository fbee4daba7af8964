use serde::{Deserialize, Serialize};

use crate::CameraIntrinsics;

/// Kannala-Brandt style fisheye distortion: the distorted radius is a
/// degree-9 odd polynomial in the incidence angle,
/// `theta_d = theta (1 + k1 th^2 + k2 th^4 + k3 th^6 + k4 th^8)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FisheyeDistortion {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl FisheyeDistortion {
    pub fn new(k1: f64, k2: f64, k3: f64, k4: f64) -> Self {
        Self { k1, k2, k3, k4 }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn coeffs(&self) -> [f64; 4] {
        [self.k1, self.k2, self.k3, self.k4]
    }

    /// Distorted radius for an incidence angle.
    pub fn distort_angle(&self, theta: f64) -> f64 {
        let t2 = theta * theta;
        let t4 = t2 * t2;
        let t6 = t4 * t2;
        let t8 = t4 * t4;
        theta * (1.0 + self.k1 * t2 + self.k2 * t4 + self.k3 * t6 + self.k4 * t8)
    }

    /// Map a point on the unit-focal pinhole plane to the fisheye image
    /// plane.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r = (x * x + y * y).sqrt();
        if r < 1e-12 {
            return (x, y);
        }
        let theta = r.atan();
        let scale = self.distort_angle(theta) / r;
        (x * scale, y * scale)
    }

    /// Inverse of [`apply`](Self::apply): recover pinhole-plane
    /// coordinates from fisheye-plane ones by Newton inversion of the
    /// angle polynomial.
    pub fn remove(&self, xd: f64, yd: f64) -> (f64, f64) {
        let theta_d = (xd * xd + yd * yd).sqrt();
        if theta_d < 1e-12 {
            return (xd, yd);
        }

        let mut theta = theta_d;
        for _ in 0..10 {
            let t2 = theta * theta;
            let t4 = t2 * t2;
            let t6 = t4 * t2;
            let t8 = t4 * t4;
            let f = theta * (1.0 + self.k1 * t2 + self.k2 * t4 + self.k3 * t6 + self.k4 * t8)
                - theta_d;
            let df =
                1.0 + 3.0 * self.k1 * t2 + 5.0 * self.k2 * t4 + 7.0 * self.k3 * t6
                    + 9.0 * self.k4 * t8;
            if df.abs() < 1e-12 {
                break;
            }
            let step = f / df;
            theta -= step;
            if step.abs() < 1e-12 {
                break;
            }
        }

        let scale = theta.tan() / theta_d;
        (xd * scale, yd * scale)
    }
}

/// A calibrated fisheye camera: pinhole intrinsics plus the radial
/// distortion polynomial. Immutable once produced by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FisheyeCamera {
    pub intrinsics: CameraIntrinsics,
    pub distortion: FisheyeDistortion,
}

impl FisheyeCamera {
    pub fn new(intrinsics: CameraIntrinsics, distortion: FisheyeDistortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distort_angle_is_identity_without_coeffs() {
        let d = FisheyeDistortion::none();
        assert!((d.distort_angle(0.4) - 0.4).abs() < 1e-15);
    }

    #[test]
    fn apply_remove_roundtrip() {
        let d = FisheyeDistortion::new(-0.01, 0.005, -0.002, 0.001);
        for &(x, y) in &[(0.1, 0.05), (-0.3, 0.2), (0.45, -0.4), (0.0, 0.0)] {
            let (xd, yd) = d.apply(x, y);
            let (xu, yu) = d.remove(xd, yd);
            assert!((xu - x).abs() < 1e-9, "x: {x} -> {xu}");
            assert!((yu - y).abs() < 1e-9, "y: {y} -> {yu}");
        }
    }

    #[test]
    fn zero_coeffs_apply_is_equidistant() {
        // With all coefficients zero the mapping is the pure equidistant
        // projection: radius atan(r), direction preserved.
        let d = FisheyeDistortion::none();
        let (xd, yd) = d.apply(0.3, 0.0);
        assert!((xd - 0.3_f64.atan()).abs() < 1e-12);
        assert!(yd.abs() < 1e-15);
    }

    #[test]
    fn camera_serializes() {
        let cam = FisheyeCamera::new(
            CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480),
            FisheyeDistortion::new(-0.01, 0.0, 0.0, 0.0),
        );
        let json = serde_json::to_string(&cam).unwrap();
        let back: FisheyeCamera = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cam);
    }
}
