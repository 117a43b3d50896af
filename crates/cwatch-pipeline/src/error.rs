//! Error types for the detection pipeline.

use std::time::Duration;

use cwatch_models::{FailureKind, FrameId, Stage, StageFailure};
use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by pipeline components.
///
/// Only [`PipelineError::Config`] and [`PipelineError::MissingModel`] are
/// fatal; they are returned at construction time. Everything else is
/// recoverable and scoped to a single frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown frame {0} (already evicted or never created)")]
    UnknownFrame(FrameId),

    #[error("Stage {stage} already recorded for frame {frame_id}")]
    StageAlreadyRecorded { frame_id: FrameId, stage: Stage },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Required model not configured: {0}")]
    MissingModel(&'static str),

    #[error("Frame from camera {actual} routed to orchestrator for {expected}")]
    CameraMismatch { expected: String, actual: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error only affects a single frame.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::MissingModel(_))
    }
}

/// Failure of a single stage task.
///
/// Every stage returns `Result<StageOutput, StageError>`; errors become
/// explicit `Failed` slots via [`StageError::failure`].
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model returned {actual} results for {expected} inputs")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker pool saturated")]
    Rejected,

    #[error("task panicked")]
    Panicked,

    #[error("upstream stage {0} produced no evidence")]
    DependencyUnavailable(Stage),
}

impl StageError {
    /// Create an inference error.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference(message.into())
    }

    /// Check the one-result-per-input contract of batched models.
    pub fn check_len(expected: usize, actual: usize) -> Result<(), StageError> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::OutputMismatch { expected, actual })
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Inference(_) => FailureKind::Error,
            Self::OutputMismatch { .. } => FailureKind::InvalidOutput,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Rejected => FailureKind::Rejected,
            Self::Panicked => FailureKind::Panicked,
            Self::DependencyUnavailable(_) => FailureKind::DependencyUnavailable,
        }
    }

    /// Serializable failure record for the stage slot.
    pub fn failure(&self) -> StageFailure {
        StageFailure::new(self.kind(), self.to_string())
    }
}
