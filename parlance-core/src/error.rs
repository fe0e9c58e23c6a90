use thiserror::Error;

/// All errors produced by parlance-core.
#[derive(Debug, Error)]
pub enum ParlanceError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("transport channel error: {0}")]
    Transport(String),

    #[error("invalid start configuration: {0}")]
    InvalidStart(String),

    #[error("processor is not running")]
    NotRunning,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParlanceError>;
