//! Pipeline configuration.
//!
//! Each component owns its own `*Config`; [`PipelineConfig`] aggregates them
//! and reads overrides from `CWATCH_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use cwatch_models::Condition;

use crate::async_pipeline::WorkerPoolConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::DetectionCacheConfig;
use crate::frame_skip::FrameSkipConfig;
use crate::metadata::MetadataConfig;
use crate::smoother::SmootherConfig;
use crate::state_manager::StabilityConfig;
use crate::sync_cache::SyncCacheConfig;
use crate::tracker::TrackerConfig;

/// Qualifying cutoffs per stage.
#[derive(Debug, Clone)]
pub struct ConfidenceThresholds {
    /// Person detections below this are dropped
    pub person: f64,
    /// Missing-object evidence (1 - best object confidence) at or above this qualifies
    pub compliance_object: f64,
    /// Keypoints below this are ignored
    pub pose_keypoint: f64,
    /// Action confidence at or above this qualifies
    pub action: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            person: 0.5,
            compliance_object: 0.5,
            pose_keypoint: 0.3,
            action: 0.6,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub frame_skip: FrameSkipConfig,
    pub smoother: SmootherConfig,
    pub stability: StabilityConfig,
    pub sync: SyncCacheConfig,
    pub workers: WorkerPoolConfig,
    pub metadata: MetadataConfig,
    pub detection_cache: DetectionCacheConfig,
    pub tracker: TrackerConfig,
    pub thresholds: ConfidenceThresholds,
    /// Detector class id treated as a person; other classes are dropped
    pub person_class_id: u32,
    /// `(width, height)` of compliance-object detector crops
    pub compliance_roi_size: (u32, u32),
    /// `(width, height)` of pose estimator crops
    pub pose_roi_size: (u32, u32),
    /// Objects every person must wear (e.g. `hairnet`)
    pub required_objects: Vec<String>,
    /// Actions tracked as conditions (e.g. `hand_washing`)
    pub monitored_actions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: FrameSkipConfig::default(),
            smoother: SmootherConfig::default(),
            stability: StabilityConfig::default(),
            sync: SyncCacheConfig::default(),
            workers: WorkerPoolConfig::default(),
            metadata: MetadataConfig::default(),
            detection_cache: DetectionCacheConfig::default(),
            tracker: TrackerConfig::default(),
            thresholds: ConfidenceThresholds::default(),
            person_class_id: 0,
            compliance_roi_size: (224, 224),
            pose_roi_size: (192, 256),
            required_objects: vec!["hairnet".to_string()],
            monitored_actions: vec!["hand_washing".to_string()],
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs_f64(env_or(key, default.as_secs_f64()).max(0.0))
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default.to_vec(),
    }
}

impl PipelineConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();

        let thresholds = ConfidenceThresholds {
            person: env_or("CWATCH_PERSON_THRESHOLD", d.thresholds.person),
            compliance_object: env_or(
                "CWATCH_COMPLIANCE_THRESHOLD",
                d.thresholds.compliance_object,
            ),
            pose_keypoint: env_or("CWATCH_POSE_KEYPOINT_THRESHOLD", d.thresholds.pose_keypoint),
            action: env_or("CWATCH_ACTION_THRESHOLD", d.thresholds.action),
        };

        let workers = WorkerPoolConfig {
            max_concurrency: env_or("CWATCH_MAX_CONCURRENCY", d.workers.max_concurrency),
            max_queue_depth: env_or("CWATCH_MAX_QUEUE_DEPTH", d.workers.max_queue_depth),
            stage_timeout: env_millis("CWATCH_MODEL_TIMEOUT_MS", d.workers.stage_timeout),
        };

        let join_timeout = env_millis("CWATCH_JOIN_TIMEOUT_MS", d.sync.join_timeout);
        let sync = SyncCacheConfig {
            join_timeout,
            arrival_timeout: workers.stage_timeout + join_timeout,
            ..d.sync
        };

        Self {
            frame_skip: FrameSkipConfig {
                skip_interval: env_or("CWATCH_SKIP_INTERVAL", d.frame_skip.skip_interval),
                motion_threshold: env_or("CWATCH_MOTION_THRESHOLD", d.frame_skip.motion_threshold),
                min_detection_interval: env_millis(
                    "CWATCH_MIN_DETECTION_INTERVAL_MS",
                    d.frame_skip.min_detection_interval,
                ),
                ..d.frame_skip
            },
            smoother: SmootherConfig {
                alpha: env_or("CWATCH_SMOOTHING_ALPHA", d.smoother.alpha),
                window: env_or("CWATCH_SMOOTHING_WINDOW", d.smoother.window),
                jitter_threshold: env_or("CWATCH_JITTER_THRESHOLD", d.smoother.jitter_threshold),
                min_keypoint_confidence: thresholds.pose_keypoint,
            },
            stability: StabilityConfig {
                stability_frames: env_or("CWATCH_STABILITY_FRAMES", d.stability.stability_frames),
                ..d.stability
            },
            sync,
            workers,
            metadata: MetadataConfig {
                ttl: env_secs("CWATCH_METADATA_TTL_SECS", d.metadata.ttl),
                capacity: env_or("CWATCH_METADATA_CAPACITY", d.metadata.capacity),
                ..d.metadata
            },
            detection_cache: DetectionCacheConfig {
                ttl: env_secs("CWATCH_CACHE_TTL_SECS", d.detection_cache.ttl),
                ..d.detection_cache
            },
            tracker: TrackerConfig {
                iou_threshold: env_or("CWATCH_TRACKER_IOU", d.tracker.iou_threshold),
                max_gap: env_or("CWATCH_TRACKER_MAX_GAP", d.tracker.max_gap),
            },
            thresholds,
            person_class_id: env_or("CWATCH_PERSON_CLASS_ID", d.person_class_id),
            compliance_roi_size: d.compliance_roi_size,
            pose_roi_size: d.pose_roi_size,
            required_objects: env_list("CWATCH_REQUIRED_OBJECTS", &d.required_objects),
            monitored_actions: env_list("CWATCH_MONITORED_ACTIONS", &d.monitored_actions),
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        fn unit_range(name: &str, value: f64) -> PipelineResult<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(PipelineError::config(format!("{name} must be within 0..=1, got {value}")))
            }
        }

        if self.frame_skip.skip_interval == 0 {
            return Err(PipelineError::config("skip_interval must be at least 1"));
        }
        if self.frame_skip.grid_cols == 0 || self.frame_skip.grid_rows == 0 {
            return Err(PipelineError::config("motion grid must be non-empty"));
        }
        if !(self.smoother.alpha > 0.0 && self.smoother.alpha <= 1.0) {
            return Err(PipelineError::config(format!(
                "alpha must be within (0, 1], got {}",
                self.smoother.alpha
            )));
        }
        if self.stability.stability_frames == 0 {
            return Err(PipelineError::config("stability_frames must be at least 1"));
        }
        if self.sync.join_timeout.is_zero() {
            return Err(PipelineError::config("join_timeout must be positive"));
        }
        if self.sync.arrival_timeout < self.workers.stage_timeout {
            return Err(PipelineError::config(
                "arrival_timeout must not be shorter than the model timeout",
            ));
        }
        if self.workers.max_concurrency == 0 {
            return Err(PipelineError::config("max_concurrency must be at least 1"));
        }
        if self.metadata.capacity == 0 {
            return Err(PipelineError::config("metadata capacity must be at least 1"));
        }
        for (name, (w, h)) in [
            ("compliance_roi_size", self.compliance_roi_size),
            ("pose_roi_size", self.pose_roi_size),
        ] {
            if w == 0 || h == 0 {
                return Err(PipelineError::config(format!("{name} must be non-empty")));
            }
        }

        unit_range("person threshold", self.thresholds.person)?;
        unit_range("compliance_object threshold", self.thresholds.compliance_object)?;
        unit_range("pose_keypoint threshold", self.thresholds.pose_keypoint)?;
        unit_range("action threshold", self.thresholds.action)?;
        Ok(())
    }

    /// Conditions tracked for every person.
    pub fn conditions(&self) -> Vec<Condition> {
        self.required_objects
            .iter()
            .map(|o| Condition::MissingObject(o.clone()))
            .chain(self.monitored_actions.iter().map(|a| Condition::Action(a.clone())))
            .collect()
    }
}
