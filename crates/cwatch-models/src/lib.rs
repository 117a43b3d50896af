//! Shared data models for the compliance-watch pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Detection stages and their write-once result slots
//! - Geometry (bounding boxes, keypoints)
//! - Per-person detections from the primary and secondary models
//! - Compliance events emitted by the stability state machine
//! - Frame records handed to the persistence layer

pub mod detection;
pub mod event;
pub mod frame_record;
pub mod geometry;
pub mod stage;

/// Frame identifier, monotonically increasing per camera stream.
pub type FrameId = u64;

/// Track identifier assigned by the tracker.
pub type TrackId = u32;

// Re-export common types
pub use detection::{
    ActionPrediction, ComplianceObject, PersonAction, PersonCompliance, PersonDetection,
    PersonPose, PoseEstimate, PoseSequence, TrackedPerson,
};
pub use event::{ComplianceEvent, Condition, EventId, EventType};
pub use frame_record::FrameRecord;
pub use geometry::{BoundingBox, Keypoint};
pub use stage::{
    FailureKind, SlotStatus, Stage, StageFailure, StageOutcome, StageOutput, StageParseError,
    StageResults, StageSlot,
};
