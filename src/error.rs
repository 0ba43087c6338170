use thiserror::Error;

use crate::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid capture buffer capacity: {0}")]
    InvalidCapacity(usize),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("crop failed: {0}")]
    Crop(String),

    #[error("quality model failed: {0}")]
    QualityModel(String),

    #[error("dimension mismatch (expected {expected}, got {got})")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
