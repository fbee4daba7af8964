use fisheyecal_core::PatternGeometry;
use nalgebra::Point3;

/// Canonical 3D positions of the inner checkerboard corners.
///
/// Points lie in the target plane z = 0 and are emitted row-major:
/// `(col * square_size, row * square_size, 0)` for every row, then every
/// column. The detector returns image points in the same traversal order
/// so the two sequences zip positionally.
pub fn board_object_points(geometry: &PatternGeometry) -> Vec<Point3<f64>> {
    let s = geometry.square_size();
    let mut points = Vec::with_capacity(geometry.point_count());
    for row in 0..geometry.rows() {
        for col in 0..geometry.cols() {
            points.push(Point3::new(col as f64 * s, row as f64 * s, 0.0));
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_ordering() {
        let g = PatternGeometry::new(2, 3, 10.0).unwrap();
        let pts = board_object_points(&g);
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(pts[1], Point3::new(10.0, 0.0, 0.0));
        assert_eq!(pts[3], Point3::new(0.0, 10.0, 0.0));
        assert!(pts.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn scales_linearly_with_square_size() {
        let a = board_object_points(&PatternGeometry::new(4, 5, 1.0).unwrap());
        let b = board_object_points(&PatternGeometry::new(4, 5, 17.0).unwrap());
        for (pa, pb) in a.iter().zip(b.iter()) {
            assert!((pb.coords - pa.coords * 17.0).norm() < 1e-12);
        }
    }
}
