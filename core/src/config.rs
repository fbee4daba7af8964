use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Geometry of the planar calibration target.
///
/// `rows` and `cols` count the inner checkerboard corners, `square_size`
/// is the edge length of one square in the caller's metric unit
/// (typically millimeters). Validated once at construction and read-only
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternGeometry {
    rows: usize,
    cols: usize,
    square_size: f64,
}

impl PatternGeometry {
    pub fn new(rows: usize, cols: usize, square_size: f64) -> Result<Self> {
        if rows < 2 || cols < 2 {
            return Err(Error::InvalidConfiguration(format!(
                "pattern must have at least 2x2 inner corners, got {rows}x{cols}"
            )));
        }
        if !square_size.is_finite() || square_size <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "square size must be a positive finite number, got {square_size}"
            )));
        }
        Ok(Self {
            rows,
            cols,
            square_size,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }

    /// Total number of inner corners on the target.
    pub fn point_count(&self) -> usize {
        self.rows * self.cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_geometry() {
        let g = PatternGeometry::new(6, 9, 17.0).unwrap();
        assert_eq!(g.rows(), 6);
        assert_eq!(g.cols(), 9);
        assert_eq!(g.point_count(), 54);
    }

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(PatternGeometry::new(1, 9, 17.0).is_err());
        assert!(PatternGeometry::new(6, 0, 17.0).is_err());
    }

    #[test]
    fn rejects_bad_square_size() {
        assert!(PatternGeometry::new(6, 9, 0.0).is_err());
        assert!(PatternGeometry::new(6, 9, -1.0).is_err());
        assert!(PatternGeometry::new(6, 9, f64::NAN).is_err());
    }
}
