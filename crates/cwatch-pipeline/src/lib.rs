//! Detection orchestration for multi-camera compliance monitoring.
//!
//! This crate provides:
//! - A sharded, write-once frame metadata store
//! - Motion/interval frame gating and a fingerprint result cache
//! - ROI batch extraction with inverse coordinate mapping
//! - A bounded worker pool with per-call timeouts and panic isolation
//! - Per-frame fusion of asynchronously arriving stage results
//! - Keypoint smoothing and per-track stability state machines
//! - The per-camera [`Orchestrator`] tying these together

pub mod async_pipeline;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod frame_skip;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod providers;
pub mod roi;
pub mod smoother;
pub mod state_manager;
pub mod sync_cache;
pub mod tracker;

pub use async_pipeline::{AsyncDetectionPipeline, StageReport, StageTask, WorkerPoolConfig};
pub use config::{ConfidenceThresholds, PipelineConfig};
pub use error::{PipelineError, PipelineResult, StageError};
pub use fingerprint::{DetectionCache, DetectionCacheConfig, Fingerprint};
pub use frame::{Frame, FrameHandle};
pub use frame_skip::{FrameSkipConfig, FrameSkipDetector, ProcessTrigger};
pub use metadata::{FrameMetadata, FrameMetadataManager, MetadataConfig};
pub use metrics::{PipelineStats, StatsSnapshot};
pub use orchestrator::{
    Diagnostics, FrameOutcome, Models, Orchestrator, PipelineBuilder, PipelineContext,
    SweepReport,
};
pub use providers::{ActionClassifier, ComplianceObjectDetector, PersonDetector, PoseEstimator};
pub use roi::{CropMapping, RoiBatch, RoiBatchExtractor};
pub use smoother::{SmootherConfig, TemporalSmoother};
pub use state_manager::{
    ConditionSignal, Evidence, StabilityConfig, StabilityState, StateManager, TrackObservation,
    TrackUpdate,
};
pub use sync_cache::{FuseStatus, FusedResult, SyncCacheConfig, SynchronizedCache};
pub use tracker::{IoUTracker, TrackerConfig};
