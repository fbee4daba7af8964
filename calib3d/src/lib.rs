pub type CalibError = fisheyecal_core::Error;
pub type Result<T> = fisheyecal_core::Result<T>;

pub mod board;
pub use board::board_object_points;

pub mod detect;
pub use detect::{find_board_corners, refine_corners_subpix};

pub mod project;
pub use project::{project_board_point, project_board_points, undistort_points};

pub mod pose;
pub use pose::{estimate_board_pose, refine_board_pose};

pub mod solver;
pub use solver::{
    calibrate_fisheye, calibrate_from_files, calibrate_from_images, BoardObservation,
    CalibrationReport, FisheyeCalibrationOptions, FisheyeCalibrationResult,
};

pub mod undistort;
pub use undistort::{
    build_undistort_map, output_intrinsics_scaled, undistort_image, UndistortionMap,
};
