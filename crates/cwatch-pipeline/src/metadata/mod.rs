//! Per-frame metadata and its concurrent lifecycle manager.

mod manager;

pub use manager::{FrameMetadataManager, MetadataConfig};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cwatch_models::{FrameId, FrameRecord, Stage, StageResults};

use crate::frame::FrameHandle;

/// Stage latencies recorded for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingTimes(BTreeMap<Stage, Duration>);

impl ProcessingTimes {
    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.0.get(&stage).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, Duration)> + '_ {
        self.0.iter().map(|(s, d)| (*s, *d))
    }

    pub fn total(&self) -> Duration {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, stage: Stage, elapsed: Duration) {
        self.0.insert(stage, elapsed);
    }
}

/// Immutable snapshot of one frame's processing state.
///
/// Obtained from [`FrameMetadataManager::get`] or handed off by
/// [`FrameMetadataManager::evict`]. The pixel buffer is shared, not copied.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    frame_id: FrameId,
    camera_id: String,
    captured_at: Instant,
    received_at: DateTime<Utc>,
    raw_frame: FrameHandle,
    stage_results: StageResults,
    processing_times: ProcessingTimes,
    from_cache: bool,
}

impl FrameMetadata {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn raw_frame(&self) -> &FrameHandle {
        &self.raw_frame
    }

    pub fn stage_results(&self) -> &StageResults {
        &self.stage_results
    }

    pub fn processing_times(&self) -> &ProcessingTimes {
        &self.processing_times
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Pixel-free projection for persistence.
    pub fn to_record(&self) -> FrameRecord {
        FrameRecord {
            frame_id: self.frame_id,
            camera_id: self.camera_id.clone(),
            received_at: self.received_at,
            width: self.raw_frame.width(),
            height: self.raw_frame.height(),
            stage_results: self.stage_results.clone(),
            processing_times_ms: self
                .processing_times
                .iter()
                .map(|(s, d)| (s, d.as_secs_f64() * 1000.0))
                .collect(),
            from_cache: self.from_cache,
        }
    }
}
