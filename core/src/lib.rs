pub mod config;
pub mod fisheye;
pub mod geometry;

pub use config::*;
pub use fisheye::*;
pub use geometry::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("image error: {0}")]
    ImageError(String),
}
