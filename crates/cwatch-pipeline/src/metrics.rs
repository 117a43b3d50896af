//! Pipeline metrics.
//!
//! Two layers: the `metrics` facade (exported by whatever recorder the host
//! installs, e.g. Prometheus) and in-process atomic [`PipelineStats`] for
//! diagnostics snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cwatch_models::{EventType, FailureKind, Stage};
use metrics::{counter, gauge, histogram};
use serde::Serialize;

/// Metric names as constants for consistency.
pub mod names {
    // Frame flow
    pub const FRAMES_TOTAL: &str = "cwatch_frames_total";
    pub const FRAME_DURATION_SECONDS: &str = "cwatch_frame_duration_seconds";

    // Stages
    pub const STAGE_DURATION_SECONDS: &str = "cwatch_stage_duration_seconds";
    pub const STAGE_FAILURES_TOTAL: &str = "cwatch_stage_failures_total";
    pub const WORKER_IN_FLIGHT: &str = "cwatch_worker_in_flight";
    pub const ROI_BATCH_SIZE: &str = "cwatch_roi_batch_size";

    // Caches
    pub const DETECTION_CACHE_LOOKUPS_TOTAL: &str = "cwatch_detection_cache_lookups_total";
    pub const FUSION_TIMEOUTS_TOTAL: &str = "cwatch_fusion_timeouts_total";
    pub const METADATA_LIVE_FRAMES: &str = "cwatch_metadata_live_frames";
    pub const METADATA_OVERFLOW_TOTAL: &str = "cwatch_metadata_overflow_evictions_total";

    // Events
    pub const EVENTS_TOTAL: &str = "cwatch_events_total";
}

/// Record a frame leaving the orchestrator (`skipped`, `cached`, `processed`).
pub fn record_frame(camera_id: &str, outcome: &'static str) {
    let labels = [
        ("camera_id", camera_id.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::FRAMES_TOTAL, &labels).increment(1);
}

pub fn record_frame_duration(camera_id: &str, duration: Duration) {
    let labels = [("camera_id", camera_id.to_string())];
    histogram!(names::FRAME_DURATION_SECONDS, &labels).record(duration.as_secs_f64());
}

pub fn record_stage_duration(stage: Stage, duration: Duration) {
    histogram!(names::STAGE_DURATION_SECONDS, "stage" => stage.as_str())
        .record(duration.as_secs_f64());
}

pub fn record_stage_failure(stage: Stage, kind: FailureKind) {
    counter!(
        names::STAGE_FAILURES_TOTAL,
        "stage" => stage.as_str(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub fn set_in_flight(count: usize) {
    gauge!(names::WORKER_IN_FLIGHT).set(count as f64);
}

pub fn record_roi_batch(size: usize) {
    histogram!(names::ROI_BATCH_SIZE).record(size as f64);
}

pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(names::DETECTION_CACHE_LOOKUPS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_fusion_timeout() {
    counter!(names::FUSION_TIMEOUTS_TOTAL).increment(1);
}

pub fn set_live_frames(count: usize) {
    gauge!(names::METADATA_LIVE_FRAMES).set(count as f64);
}

pub fn record_metadata_overflow() {
    counter!(names::METADATA_OVERFLOW_TOTAL).increment(1);
}

pub fn record_event(event_type: EventType) {
    counter!(names::EVENTS_TOTAL, "event_type" => event_type.as_str()).increment(1);
}

/// In-process counters shared by all streams of a pipeline context.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_received: AtomicU64,
    frames_skipped: AtomicU64,
    frames_cached: AtomicU64,
    frames_processed: AtomicU64,
    stage_failures: [AtomicU64; 4],
    rejections: AtomicU64,
    join_timeouts: AtomicU64,
    unknown_frame_writes: AtomicU64,
    roi_batches: AtomicU64,
    events_confirmed: AtomicU64,
    events_ended: AtomicU64,
    processing_micros: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.frames_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_stage_failure(&self, stage: Stage) {
        self.stage_failures[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_timeout(&self) {
        self.join_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_frame(&self) {
        self.unknown_frame_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_roi_batch(&self) {
        self.roi_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self, event_type: EventType) {
        match event_type {
            EventType::Confirmed => self.events_confirmed.fetch_add(1, Ordering::Relaxed),
            EventType::Ended => self.events_ended.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let processed = load(&self.frames_processed);
        StatsSnapshot {
            frames_received: load(&self.frames_received),
            frames_skipped: load(&self.frames_skipped),
            frames_cached: load(&self.frames_cached),
            frames_processed: processed,
            stage_failures: Stage::ALL
                .into_iter()
                .map(|s| (s.as_str(), load(&self.stage_failures[s.index()])))
                .collect(),
            rejections: load(&self.rejections),
            join_timeouts: load(&self.join_timeouts),
            unknown_frame_writes: load(&self.unknown_frame_writes),
            roi_batches: load(&self.roi_batches),
            events_confirmed: load(&self.events_confirmed),
            events_ended: load(&self.events_ended),
            avg_processing_ms: if processed > 0 {
                load(&self.processing_micros) as f64 / processed as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Serializable view of [`PipelineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub frames_cached: u64,
    pub frames_processed: u64,
    pub stage_failures: Vec<(&'static str, u64)>,
    pub rejections: u64,
    pub join_timeouts: u64,
    pub unknown_frame_writes: u64,
    pub roi_batches: u64,
    pub events_confirmed: u64,
    pub events_ended: u64,
    pub avg_processing_ms: f64,
}

impl StatsSnapshot {
    pub fn stage_failures(&self, stage: Stage) -> u64 {
        self.stage_failures
            .iter()
            .find(|(name, _)| *name == stage.as_str())
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = PipelineStats::new();
        stats.record_received();
        stats.record_processed(Duration::from_millis(4));
        stats.record_processed(Duration::from_millis(6));
        stats.record_stage_failure(Stage::Pose);
        stats.record_event(EventType::Confirmed);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 2);
        assert!((snap.avg_processing_ms - 5.0).abs() < 1e-9);
        assert_eq!(snap.stage_failures(Stage::Pose), 1);
        assert_eq!(snap.stage_failures(Stage::Person), 0);
        assert_eq!(snap.events_confirmed, 1);
    }

    #[test]
    fn test_facade_calls_without_recorder() {
        // No recorder installed: calls are no-ops.
        record_stage_failure(Stage::Action, FailureKind::Timeout);
        record_cache_lookup(true);
        set_live_frames(3);
    }
}
