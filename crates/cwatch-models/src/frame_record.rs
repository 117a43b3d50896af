//! Persistence-facing projection of a processed frame.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::stage::{Stage, StageResults};
use crate::FrameId;

/// Frame metadata without pixels, ready for the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameRecord {
    pub frame_id: FrameId,
    pub camera_id: String,
    pub received_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub stage_results: StageResults,
    /// Stage latency in milliseconds
    #[serde(default)]
    pub processing_times_ms: BTreeMap<Stage, f64>,
    /// Whether the results were served from the fingerprint cache
    #[serde(default)]
    pub from_cache: bool,
}

impl FrameRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
