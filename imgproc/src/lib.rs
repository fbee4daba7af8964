pub mod sampling;
pub mod threshold;

pub use sampling::*;
pub use threshold::*;

/// Resampling filter used when reading between pixel centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// What to read when a sample coordinate falls outside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    Constant(u8),
    Replicate,
}
