//! Model interfaces consumed by the orchestrator.
//!
//! Implementations wrap inference backends (local runtimes, remote model
//! servers). Batched models must return exactly one result per input, in
//! input order; a length mismatch is treated as a stage failure.

use async_trait::async_trait;
use cwatch_models::{
    ActionPrediction, ComplianceObject, PersonDetection, PoseEstimate, PoseSequence,
};

use crate::error::StageError;
use crate::frame::FrameHandle;
use crate::roi::RoiBatch;

/// Primary detector run on whole frames.
#[async_trait]
pub trait PersonDetector: Send + Sync {
    /// Detect persons in frame coordinates.
    async fn detect(&self, frame: &FrameHandle) -> Result<Vec<PersonDetection>, StageError>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Compliance-object detector run on person crops.
#[async_trait]
pub trait ComplianceObjectDetector: Send + Sync {
    /// One object list per crop, boxes in crop coordinates.
    async fn infer(&self, batch: &RoiBatch) -> Result<Vec<Vec<ComplianceObject>>, StageError>;

    fn name(&self) -> &'static str;
}

/// Pose estimator run on person crops.
#[async_trait]
pub trait PoseEstimator: Send + Sync {
    /// One estimate per crop, keypoints in crop coordinates.
    async fn infer(&self, batch: &RoiBatch) -> Result<Vec<PoseEstimate>, StageError>;

    fn name(&self) -> &'static str;
}

/// Action classifier run on smoothed keypoint sequences.
#[async_trait]
pub trait ActionClassifier: Send + Sync {
    /// One prediction list per sequence.
    async fn infer(
        &self,
        sequences: &[PoseSequence],
    ) -> Result<Vec<Vec<ActionPrediction>>, StageError>;

    fn name(&self) -> &'static str;
}
