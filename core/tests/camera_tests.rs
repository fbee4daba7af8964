use fisheyecal_core::{CameraIntrinsics, FisheyeCamera, FisheyeDistortion, PatternGeometry};

#[test]
fn equidistant_projection_without_coeffs() {
    let d = FisheyeDistortion::none();
    let k = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);

    // Unit-focal point at x = 0.2: theta = atan(0.2), radius theta on
    // the fisheye plane.
    let (xd, yd) = d.apply(0.2, 0.0);
    let p = k.to_pixel(xd, yd);
    assert!((p.x - (320.0 + 500.0 * 0.2f64.atan())).abs() < 1e-9);
    assert!((p.y - 240.0).abs() < 1e-9);
    assert!(yd.abs() < 1e-15);
}

#[test]
fn distortion_inverse_is_consistent_at_wide_angles() {
    let d = FisheyeDistortion::new(-0.028, 0.006, -0.0012, 0.0003);
    // Up to roughly 63 degrees off-axis.
    for i in 1..20 {
        let x = i as f64 * 0.1;
        let (xd, yd) = d.apply(x, x * 0.5);
        let (xu, yu) = d.remove(xd, yd);
        assert!((xu - x).abs() < 1e-8, "x {x}: {xu}");
        assert!((yu - x * 0.5).abs() < 1e-8, "y {x}: {yu}");
    }
}

#[test]
fn skew_enters_pixel_mapping() {
    let mut k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480);
    k.skew = 2.0;
    let p = k.to_pixel(0.0, 0.1);
    assert!((p.x - (320.0 + 2.0 * 0.1)).abs() < 1e-12);
}

#[test]
fn camera_json_roundtrip() {
    let cam = FisheyeCamera::new(
        CameraIntrinsics::new(481.2, 479.8, 318.4, 241.1, 640, 480),
        FisheyeDistortion::new(-0.021, 0.0043, -0.0011, 0.00021),
    );
    let json = serde_json::to_string_pretty(&cam).unwrap();
    let back: FisheyeCamera = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cam);
}

#[test]
fn pattern_geometry_validation() {
    assert!(PatternGeometry::new(6, 9, 17.0).is_ok());
    assert!(PatternGeometry::new(1, 9, 17.0).is_err());
    assert!(PatternGeometry::new(6, 9, 0.0).is_err());
    assert!(PatternGeometry::new(6, 9, f64::NAN).is_err());
}
