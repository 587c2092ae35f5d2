use thiserror::Error;

/// Runtime failures of the loader and compositor.
///
/// None of these reach the view layer: the loader turns them into `None`
/// and the engine answers with the unfiltered source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("lut asset not found: {0}")]
    AssetNotFound(String),
    #[error("failed to decode lut image: {0}")]
    DecodeFailure(String),
    #[error("lut is {width}x{height}, expected {expected}x{expected}")]
    InvalidLutDimensions {
        width: u32,
        height: u32,
        expected: u32,
    },
    #[error("shader construction failed: {0}")]
    ShaderConstructionFailure(String),
    #[error("offscreen surface allocation failed: {0}")]
    SurfaceAllocationFailure(String),
    #[error("no compatible gpu adapter")]
    GpuUnavailable,
}

/// Caller bugs. Unlike [`FilterError`] these are returned to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown lut identifier: {0:?}")]
    UnknownLut(String),
    #[error("cache size must be at least 1, got {0}")]
    InvalidCacheSize(usize),
}
