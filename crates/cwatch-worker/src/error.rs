//! Worker error types.

use cwatch_pipeline::PipelineError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Frame source failed: {0}")]
    SourceFailed(String),

    #[error("Output sink failed: {0}")]
    SinkFailed(String),

    #[error("Telemetry setup failed: {0}")]
    TelemetryFailed(String),

    #[error("Camera {0} is already running")]
    DuplicateStream(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn source_failed(msg: impl Into<String>) -> Self {
        Self::SourceFailed(msg.into())
    }

    pub fn sink_failed(msg: impl Into<String>) -> Self {
        Self::SinkFailed(msg.into())
    }

    /// Whether the stream can keep running after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceFailed(_) | Self::SinkFailed(_) | Self::Image(_) | Self::Io(_) => true,
            Self::Pipeline(e) => e.is_recoverable(),
            Self::ConfigError(_) | Self::TelemetryFailed(_) | Self::DuplicateStream(_) => false,
        }
    }
}
