//! Compliance events emitted by the stability state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FrameId, TrackId};

/// Unique identifier for an emitted event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monitored condition on a tracked person.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum Condition {
    /// A required object (e.g. `hairnet`) is absent from the person crop
    MissingObject(String),
    /// The person performs an action (e.g. `hand_washing`)
    Action(String),
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::MissingObject(label) => write!(f, "missing_object:{}", label),
            Condition::Action(label) => write!(f, "action:{}", label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Confirmed,
    Ended,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Confirmed => "confirmed",
            EventType::Ended => "ended",
        }
    }
}

/// A stable transition of one (track, condition) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComplianceEvent {
    pub event_id: EventId,
    pub camera_id: String,
    pub track_id: TrackId,
    pub condition: Condition,
    pub event_type: EventType,
    /// First frame of the qualifying streak that led to confirmation
    pub start_frame_id: FrameId,
    /// Last qualifying frame; only set on `Ended`
    pub end_frame_id: Option<FrameId>,
    pub emitted_at: DateTime<Utc>,
}

impl ComplianceEvent {
    pub fn confirmed(
        camera_id: impl Into<String>,
        track_id: TrackId,
        condition: Condition,
        start_frame_id: FrameId,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            camera_id: camera_id.into(),
            track_id,
            condition,
            event_type: EventType::Confirmed,
            start_frame_id,
            end_frame_id: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn ended(
        camera_id: impl Into<String>,
        track_id: TrackId,
        condition: Condition,
        start_frame_id: FrameId,
        end_frame_id: FrameId,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            camera_id: camera_id.into(),
            track_id,
            condition,
            event_type: EventType::Ended,
            start_frame_id,
            end_frame_id: Some(end_frame_id),
            emitted_at: Utc::now(),
        }
    }
}
