use std::path::PathBuf;

/// Everything that can stop an evaluation.
#[derive(Debug, thiserror::Error)]
pub enum FidError {
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("reference statistics not found at {}", .0.display())]
    MissingReferenceStats(PathBuf),
    #[error("invalid parameter file: {0}")]
    InvalidParams(String),
    #[error("sample generation failed: {0}")]
    SampleGeneration(String),
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    #[error("need at least {required} samples, got {available}")]
    InsufficientSamples { required: i64, available: i64 },
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}
