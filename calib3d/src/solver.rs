//! Fisheye calibration from planar board observations.
//!
//! The solver estimates the pinhole intrinsics and the four-term angle
//! polynomial jointly over all views with Levenberg-Marquardt on the
//! pixel reprojection residuals, using numeric Jacobians. Per-view
//! poses are seeded from homography decomposition and, by default,
//! optimized alongside the camera parameters.

use std::path::Path;

use fisheyecal_core::{
    CameraIntrinsics, FisheyeCamera, FisheyeDistortion, PatternGeometry, Pose,
};
use image::GrayImage;
use nalgebra::{DMatrix, DVector, Point2, Point3};
use rayon::prelude::*;

use crate::board::board_object_points;
use crate::detect::find_board_corners;
use crate::pose::estimate_board_pose;
use crate::project::project_board_point;
use crate::{CalibError, Result};

/// Minimum number of accepted views for a solvable system.
pub const MIN_VIEWS: usize = 3;

/// One board view: object points on the target plane paired with their
/// detected pixel locations, index for index.
#[derive(Debug, Clone)]
pub struct BoardObservation {
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl BoardObservation {
    pub fn new(object_points: Vec<Point3<f64>>, image_points: Vec<Point2<f64>>) -> Result<Self> {
        if object_points.len() != image_points.len() {
            return Err(CalibError::InvalidConfiguration(format!(
                "object/image point count mismatch: {} vs {}",
                object_points.len(),
                image_points.len()
            )));
        }
        if object_points.len() < 4 {
            return Err(CalibError::InsufficientData(
                "a board view needs at least 4 corners".to_string(),
            ));
        }
        if object_points.iter().any(|p| p.z.abs() > 1e-9) {
            return Err(CalibError::InvalidConfiguration(
                "board object points must lie in the z = 0 plane".to_string(),
            ));
        }
        if image_points
            .iter()
            .any(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(CalibError::InvalidConfiguration(
                "image points must be finite".to_string(),
            ));
        }
        Ok(Self {
            object_points,
            image_points,
        })
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }
}

#[derive(Debug, Clone)]
pub struct FisheyeCalibrationOptions {
    /// Re-estimate the board poses jointly with the camera parameters.
    /// When false the poses stay at their homography seeds and only the
    /// camera parameters move.
    pub recompute_extrinsics: bool,
    /// Hold the skew term at zero instead of estimating it.
    pub fix_skew: bool,
    /// Outer Levenberg-Marquardt iteration cap.
    pub max_iters: usize,
    /// Convergence threshold on the parameter update norm.
    pub eps: f64,
    /// Optional starting intrinsics; otherwise seeded from the image
    /// size with an equidistant focal guess.
    pub initial_intrinsics: Option<CameraIntrinsics>,
}

impl Default for FisheyeCalibrationOptions {
    fn default() -> Self {
        Self {
            recompute_extrinsics: true,
            fix_skew: true,
            max_iters: 20,
            eps: 1e-6,
            initial_intrinsics: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FisheyeCalibrationResult {
    pub camera: FisheyeCamera,
    /// One pose per accepted observation, in input order.
    pub poses: Vec<Pose>,
    /// Root-mean-square pixel reprojection error over every corner.
    pub rms_reprojection_error: f64,
}

/// Per-frame accounting of a batch calibration run.
#[derive(Debug, Clone, Default)]
pub struct CalibrationReport {
    pub total_images: usize,
    pub used_images: usize,
    /// Indices (into the input sequence) of frames where the board was
    /// not found.
    pub rejected_images: Vec<usize>,
}

struct ParamLayout {
    fix_skew: bool,
    recompute_extrinsics: bool,
    views: usize,
}

impl ParamLayout {
    fn intrinsic_len(&self) -> usize {
        if self.fix_skew {
            8
        } else {
            9
        }
    }

    fn len(&self) -> usize {
        let poses = if self.recompute_extrinsics {
            6 * self.views
        } else {
            0
        };
        self.intrinsic_len() + poses
    }

    fn pack(
        &self,
        intrinsics: &CameraIntrinsics,
        distortion: &FisheyeDistortion,
        poses: &[Pose],
    ) -> DVector<f64> {
        let mut p = DVector::zeros(self.len());
        p[0] = intrinsics.fx;
        p[1] = intrinsics.fy;
        p[2] = intrinsics.cx;
        p[3] = intrinsics.cy;
        p[4] = distortion.k1;
        p[5] = distortion.k2;
        p[6] = distortion.k3;
        p[7] = distortion.k4;
        if !self.fix_skew {
            p[8] = intrinsics.skew;
        }
        if self.recompute_extrinsics {
            let base = self.intrinsic_len();
            for (v, pose) in poses.iter().enumerate() {
                let rvec = pose.rvec();
                let o = base + 6 * v;
                p[o] = rvec.x;
                p[o + 1] = rvec.y;
                p[o + 2] = rvec.z;
                p[o + 3] = pose.translation.x;
                p[o + 4] = pose.translation.y;
                p[o + 5] = pose.translation.z;
            }
        }
        p
    }

    fn unpack(
        &self,
        p: &DVector<f64>,
        width: u32,
        height: u32,
        frozen_poses: &[Pose],
    ) -> (CameraIntrinsics, FisheyeDistortion, Vec<Pose>) {
        let mut intrinsics = CameraIntrinsics::new(p[0], p[1], p[2], p[3], width, height);
        if !self.fix_skew {
            intrinsics.skew = p[8];
        }
        let distortion = FisheyeDistortion::new(p[4], p[5], p[6], p[7]);
        let poses = if self.recompute_extrinsics {
            let base = self.intrinsic_len();
            (0..self.views)
                .map(|v| {
                    let o = base + 6 * v;
                    Pose::from_rvec_tvec(
                        &nalgebra::Vector3::new(p[o], p[o + 1], p[o + 2]),
                        &nalgebra::Vector3::new(p[o + 3], p[o + 4], p[o + 5]),
                    )
                })
                .collect()
        } else {
            frozen_poses.to_vec()
        };
        (intrinsics, distortion, poses)
    }
}

fn residuals(
    layout: &ParamLayout,
    params: &DVector<f64>,
    observations: &[BoardObservation],
    width: u32,
    height: u32,
    frozen_poses: &[Pose],
) -> DVector<f64> {
    let (intrinsics, distortion, poses) = layout.unpack(params, width, height, frozen_poses);
    let total: usize = observations.iter().map(|o| o.object_points.len()).sum();
    let mut r = DVector::zeros(2 * total);
    let mut row = 0;
    for (obs, pose) in observations.iter().zip(poses.iter()) {
        for (p3, p2) in obs.object_points.iter().zip(obs.image_points.iter()) {
            let pred = project_board_point(&intrinsics, &distortion, pose, p3);
            r[row] = pred.x - p2.x;
            r[row + 1] = pred.y - p2.y;
            row += 2;
        }
    }
    r
}

/// Calibrate a fisheye camera from at least [`MIN_VIEWS`] board views.
pub fn calibrate_fisheye(
    observations: &[BoardObservation],
    image_size: (u32, u32),
    options: &FisheyeCalibrationOptions,
) -> Result<FisheyeCalibrationResult> {
    let (width, height) = image_size;
    if width == 0 || height == 0 {
        return Err(CalibError::InvalidConfiguration(
            "image size must be non-zero".to_string(),
        ));
    }
    if options.max_iters == 0 || !(options.eps > 0.0) || !options.eps.is_finite() {
        return Err(CalibError::InvalidConfiguration(
            "calibration needs max_iters >= 1 and a positive finite eps".to_string(),
        ));
    }
    if observations.len() < MIN_VIEWS {
        return Err(CalibError::InsufficientData(format!(
            "calibration needs at least {} board views, got {}",
            MIN_VIEWS,
            observations.len()
        )));
    }

    let intrinsics0 = match &options.initial_intrinsics {
        Some(k) => {
            if k.fx <= 0.0 || k.fy <= 0.0 {
                return Err(CalibError::InvalidConfiguration(
                    "initial intrinsics must have positive focal lengths".to_string(),
                ));
            }
            *k
        }
        None => {
            // Equidistant seed: a hemispherical field of view mapped
            // across the longer image side.
            let f = width.max(height) as f64 / std::f64::consts::PI;
            CameraIntrinsics::new(
                f,
                f,
                width as f64 / 2.0 - 0.5,
                height as f64 / 2.0 - 0.5,
                width,
                height,
            )
        }
    };
    let distortion0 = FisheyeDistortion::none();

    let mut seed_poses = Vec::with_capacity(observations.len());
    for obs in observations {
        seed_poses.push(estimate_board_pose(
            &obs.object_points,
            &obs.image_points,
            &intrinsics0,
            &distortion0,
        )?);
    }

    let layout = ParamLayout {
        fix_skew: options.fix_skew,
        recompute_extrinsics: options.recompute_extrinsics,
        views: observations.len(),
    };
    let mut params = layout.pack(&intrinsics0, &distortion0, &seed_poses);
    let mut r = residuals(&layout, &params, observations, width, height, &seed_poses);
    let mut cost = r.norm_squared();
    let mut lambda = 1e-3;
    let n_params = layout.len();
    let n_resid = r.len();

    for iter in 0..options.max_iters {
        // Forward-difference Jacobian, column per parameter.
        let cols: Vec<DVector<f64>> = (0..n_params)
            .into_par_iter()
            .map(|k| {
                let eps = 1e-6 * params[k].abs().max(1.0);
                let mut perturbed = params.clone();
                perturbed[k] += eps;
                let rp = residuals(&layout, &perturbed, observations, width, height, &seed_poses);
                (rp - &r) / eps
            })
            .collect();
        let mut jac = DMatrix::zeros(n_resid, n_params);
        for (k, col) in cols.iter().enumerate() {
            jac.set_column(k, col);
        }

        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        let mut accepted = false;
        let mut converged = false;
        for _ in 0..5 {
            let mut damped = jtj.clone();
            for i in 0..n_params {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(delta) = damped.lu().solve(&jtr) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = &params - &delta;
            let rc = residuals(&layout, &candidate, observations, width, height, &seed_poses);
            let new_cost = rc.norm_squared();
            if new_cost.is_finite() && new_cost < cost {
                params = candidate;
                r = rc;
                cost = new_cost;
                lambda = (lambda * 0.1).max(1e-12);
                accepted = true;
                converged = delta.norm() < options.eps;
                break;
            }
            lambda *= 10.0;
        }

        log::debug!(
            "calibration iter {}: cost {:.6e}, lambda {:.1e}",
            iter,
            cost,
            lambda
        );
        if !accepted || converged {
            break;
        }
    }

    let (intrinsics, distortion, poses) = layout.unpack(&params, width, height, &seed_poses);
    if !params.iter().all(|v| v.is_finite()) || intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
        return Err(CalibError::DegenerateGeometry(
            "calibration diverged to a non-physical camera".to_string(),
        ));
    }

    let total: usize = observations.iter().map(|o| o.object_points.len()).sum();
    let sq_sum: f64 = observations
        .par_iter()
        .zip(poses.par_iter())
        .map(|(obs, pose)| {
            obs.object_points
                .iter()
                .zip(obs.image_points.iter())
                .map(|(p3, p2)| {
                    let pred = project_board_point(&intrinsics, &distortion, pose, p3);
                    (pred.x - p2.x).powi(2) + (pred.y - p2.y).powi(2)
                })
                .sum::<f64>()
        })
        .sum();
    let rms = (sq_sum / total as f64).sqrt();

    Ok(FisheyeCalibrationResult {
        camera: FisheyeCamera {
            intrinsics,
            distortion,
        },
        poses,
        rms_reprojection_error: rms,
    })
}

/// Detect the board in each frame and calibrate from the frames where
/// it was found. Frames without the board are logged and reported, not
/// fatal; any other detection error aborts the run.
pub fn calibrate_from_images(
    images: &[GrayImage],
    geometry: &PatternGeometry,
    options: &FisheyeCalibrationOptions,
) -> Result<(FisheyeCalibrationResult, CalibrationReport)> {
    let first = images.first().ok_or_else(|| {
        CalibError::InsufficientData("no input images for calibration".to_string())
    })?;
    let size = (first.width(), first.height());
    if images
        .iter()
        .any(|im| (im.width(), im.height()) != size)
    {
        return Err(CalibError::InvalidConfiguration(
            "all calibration images must share the same dimensions".to_string(),
        ));
    }

    let object_points = board_object_points(geometry);
    let mut observations = Vec::with_capacity(images.len());
    let mut report = CalibrationReport {
        total_images: images.len(),
        ..Default::default()
    };

    for (idx, image) in images.iter().enumerate() {
        match find_board_corners(image, geometry) {
            Ok(corners) => {
                observations.push(BoardObservation::new(object_points.clone(), corners)?);
            }
            Err(CalibError::PatternNotFound(why)) => {
                log::warn!("frame {idx}: board not found ({why}), skipping");
                report.rejected_images.push(idx);
            }
            Err(e) => return Err(e),
        }
    }
    report.used_images = observations.len();

    if observations.len() < MIN_VIEWS {
        return Err(CalibError::InsufficientData(format!(
            "board found in only {} of {} frames, need {}",
            observations.len(),
            images.len(),
            MIN_VIEWS
        )));
    }

    let result = calibrate_fisheye(&observations, size, options)?;
    log::info!(
        "calibrated from {}/{} frames, rms {:.4} px",
        report.used_images,
        report.total_images,
        result.rms_reprojection_error
    );
    Ok((result, report))
}

/// Load image files, convert to grayscale and calibrate.
pub fn calibrate_from_files<P: AsRef<Path>>(
    paths: &[P],
    geometry: &PatternGeometry,
    options: &FisheyeCalibrationOptions,
) -> Result<(FisheyeCalibrationResult, CalibrationReport)> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|e| CalibError::ImageError(format!("{}: {e}", path.display())))?;
        images.push(image.to_luma8());
    }
    calibrate_from_images(&images, geometry, options)
}
