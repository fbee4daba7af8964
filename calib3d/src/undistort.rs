//! Dense undistortion: inverse-mapping tables and image remapping.
//!
//! Each output pixel is lifted through the inverse of the output
//! intrinsic matrix to a pinhole ray, pushed forward through the fisheye
//! distortion and projected with the calibrated source intrinsics. The
//! resulting lookup table feeds the bilinear remapper.

use fisheyecal_core::{CameraIntrinsics, FisheyeCamera};
use fisheyecal_imgproc::{remap, BorderMode, Interpolation};
use image::GrayImage;
use rayon::prelude::*;

use crate::{CalibError, Result};

/// Precomputed per-pixel source coordinates for undistortion. Building
/// the map is the expensive part; remapping frames through it is cheap,
/// so one map serves a whole video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortionMap {
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    width: u32,
    height: u32,
}

impl UndistortionMap {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Source coordinate sampled for output pixel `(x, y)`.
    pub fn source_coord(&self, x: u32, y: u32) -> (f32, f32) {
        let i = (y * self.width + x) as usize;
        (self.map_x[i], self.map_y[i])
    }

    /// Resample one frame through the table. Pixels that map outside
    /// the source image come out black.
    pub fn apply(&self, src: &GrayImage) -> Result<GrayImage> {
        if (src.width(), src.height()) != (self.width, self.height) {
            return Err(CalibError::InvalidConfiguration(format!(
                "frame is {}x{} but the map was built for {}x{}",
                src.width(),
                src.height(),
                self.width,
                self.height
            )));
        }
        remap(
            src,
            &self.map_x,
            &self.map_y,
            self.width,
            self.height,
            Interpolation::Linear,
            BorderMode::Constant(0),
        )
    }
}

/// Rectified view intrinsics derived from a calibration: focal lengths
/// scaled by `focal_scale` and the principal point recentered on the
/// image. A scale below 1 widens the rendered field of view, trading
/// resolution for coverage at the fisheye edges.
pub fn output_intrinsics_scaled(camera: &FisheyeCamera, focal_scale: f64) -> CameraIntrinsics {
    let k = &camera.intrinsics;
    CameraIntrinsics::new(
        k.fx * focal_scale,
        k.fy * focal_scale,
        k.width as f64 / 2.0 - 0.5,
        k.height as f64 / 2.0 - 0.5,
        k.width,
        k.height,
    )
}

/// Build the inverse-mapping table from output pixels to source pixels.
pub fn build_undistort_map(
    camera: &FisheyeCamera,
    output_intrinsics: &CameraIntrinsics,
) -> Result<UndistortionMap> {
    let width = output_intrinsics.width;
    let height = output_intrinsics.height;
    if width == 0 || height == 0 {
        return Err(CalibError::InvalidConfiguration(
            "undistortion map size must be non-zero".to_string(),
        ));
    }

    let k_out_inv = output_intrinsics
        .matrix()
        .try_inverse()
        .ok_or_else(|| {
            CalibError::InvalidConfiguration(
                "output intrinsic matrix is not invertible".to_string(),
            )
        })?;
    let src = &camera.intrinsics;
    let dist = &camera.distortion;

    let n = (width * height) as usize;
    let mut map_x = vec![0.0f32; n];
    let mut map_y = vec![0.0f32; n];
    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width as usize {
                // Output pixel -> pinhole ray in the rectified view.
                let ray = k_out_inv * nalgebra::Vector3::new(x as f64, y as f64, 1.0);
                let (xu, yu) = if ray.z.abs() > 1e-12 {
                    (ray.x / ray.z, ray.y / ray.z)
                } else {
                    (ray.x, ray.y)
                };
                // Pinhole ray -> fisheye plane -> source pixel.
                let (xd, yd) = dist.apply(xu, yu);
                let p = src.to_pixel(xd, yd);
                row_x[x] = p.x as f32;
                row_y[x] = p.y as f32;
            }
        });

    Ok(UndistortionMap {
        map_x,
        map_y,
        width,
        height,
    })
}

/// Convenience wrapper: build a map for `output_intrinsics` and remap a
/// single frame through it.
pub fn undistort_image(
    camera: &FisheyeCamera,
    output_intrinsics: &CameraIntrinsics,
    src: &GrayImage,
) -> Result<GrayImage> {
    build_undistort_map(camera, output_intrinsics)?.apply(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisheyecal_core::FisheyeDistortion;

    fn camera() -> FisheyeCamera {
        FisheyeCamera::new(
            CameraIntrinsics::new(500.0, 500.0, 319.5, 239.5, 640, 480),
            FisheyeDistortion::new(-0.02, 0.004, -0.001, 0.0002),
        )
    }

    #[test]
    fn map_has_output_dimensions() {
        let cam = camera();
        let out = output_intrinsics_scaled(&cam, 0.5);
        let map = build_undistort_map(&cam, &out).unwrap();
        assert_eq!(map.width(), 640);
        assert_eq!(map.height(), 480);
    }

    #[test]
    fn zero_size_is_rejected() {
        let cam = camera();
        let out = CameraIntrinsics::new(500.0, 500.0, 0.0, 0.0, 0, 480);
        let err = build_undistort_map(&cam, &out).unwrap_err();
        assert!(matches!(err, CalibError::InvalidConfiguration(_)));
    }

    #[test]
    fn scaled_intrinsics_halve_focal_and_recenter() {
        let cam = camera();
        let out = output_intrinsics_scaled(&cam, 0.5);
        assert!((out.fx - 250.0).abs() < 1e-12);
        assert!((out.fy - 250.0).abs() < 1e-12);
        assert!((out.cx - 319.5).abs() < 1e-12);
        assert!((out.cy - 239.5).abs() < 1e-12);
        assert_eq!(out.skew, 0.0);
    }

    #[test]
    fn map_building_is_deterministic() {
        let cam = camera();
        let out = output_intrinsics_scaled(&cam, 0.5);
        let a = build_undistort_map(&cam, &out).unwrap();
        let b = build_undistort_map(&cam, &out).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_distortion_is_near_identity_at_center() {
        // With all coefficients zero the model is pure equidistant,
        // which agrees with the pinhole mapping to first order around
        // the principal point.
        let cam = FisheyeCamera::new(
            CameraIntrinsics::new(500.0, 500.0, 319.5, 239.5, 640, 480),
            FisheyeDistortion::none(),
        );
        let map = build_undistort_map(&cam, &cam.intrinsics).unwrap();
        for &(x, y) in &[(320u32, 240u32), (290, 240), (320, 280), (350, 210)] {
            let (sx, sy) = map.source_coord(x, y);
            assert!((sx - x as f32).abs() < 0.5, "{x},{y} -> {sx}");
            assert!((sy - y as f32).abs() < 0.5, "{x},{y} -> {sy}");
        }
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let cam = camera();
        let out = output_intrinsics_scaled(&cam, 1.0);
        let map = build_undistort_map(&cam, &out).unwrap();
        let frame = GrayImage::new(320, 240);
        let err = map.apply(&frame).unwrap_err();
        assert!(matches!(err, CalibError::InvalidConfiguration(_)));
    }
}
