//! Shared pipeline components and their builder.
//!
//! A [`PipelineContext`] owns everything that is shared between camera
//! streams: the metadata manager, the fusion cache, the fingerprint cache,
//! the worker pool, and the model handles. Per-camera state lives in the
//! [`Orchestrator`] created by [`PipelineContext::orchestrator`].

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::Orchestrator;
use crate::async_pipeline::AsyncDetectionPipeline;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::DetectionCache;
use crate::metadata::FrameMetadataManager;
use crate::metrics::{PipelineStats, StatsSnapshot};
use crate::providers::{ActionClassifier, ComplianceObjectDetector, PersonDetector, PoseEstimator};
use crate::roi::RoiBatchExtractor;
use crate::sync_cache::SynchronizedCache;

/// Model handles used by every stream.
#[derive(Clone)]
pub struct Models {
    pub person: Arc<dyn PersonDetector>,
    pub compliance: Arc<dyn ComplianceObjectDetector>,
    pub pose: Arc<dyn PoseEstimator>,
    pub action: Arc<dyn ActionClassifier>,
}

/// Components shared by all orchestrators of a process.
pub struct PipelineContext {
    config: PipelineConfig,
    manager: Arc<FrameMetadataManager>,
    sync_cache: Arc<SynchronizedCache>,
    detection_cache: Arc<DetectionCache>,
    workers: AsyncDetectionPipeline,
    roi: Arc<RoiBatchExtractor>,
    stats: Arc<PipelineStats>,
    models: Models,
}

/// Result of one sweep over the shared caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub metadata: usize,
    pub fusion: usize,
    pub detection_cache: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.metadata + self.fusion + self.detection_cache
    }
}

/// Point-in-time view of the shared components.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub stats: StatsSnapshot,
    pub live_frames: usize,
    pub pending_fusions: usize,
    pub fused_complete: u64,
    pub fused_timeout: u64,
    pub late_results_dropped: u64,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub in_flight: usize,
}

impl PipelineContext {
    /// Create the per-camera orchestrator.
    pub fn orchestrator(self: &Arc<Self>, camera_id: impl Into<String>) -> Orchestrator {
        Orchestrator::new(camera_id.into(), Arc::clone(self))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<FrameMetadataManager> {
        &self.manager
    }

    pub fn sync_cache(&self) -> &Arc<SynchronizedCache> {
        &self.sync_cache
    }

    pub fn detection_cache(&self) -> &Arc<DetectionCache> {
        &self.detection_cache
    }

    pub fn workers(&self) -> &AsyncDetectionPipeline {
        &self.workers
    }

    pub fn roi(&self) -> &Arc<RoiBatchExtractor> {
        &self.roi
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn models(&self) -> &Models {
        &self.models
    }

    /// Drop expired metadata, abandoned fusion entries and stale cache
    /// entries.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            metadata: self.manager.sweep_expired(std::time::Instant::now()),
            fusion: self.sync_cache.sweep_expired(tokio::time::Instant::now()),
            detection_cache: self.detection_cache.sweep_expired(std::time::Instant::now()),
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let fusion = self.sync_cache.stats();
        let cache = self.detection_cache.stats();
        Diagnostics {
            stats: self.stats.snapshot(),
            live_frames: self.manager.len(),
            pending_fusions: self.sync_cache.pending(),
            fused_complete: fusion.fused_complete,
            fused_timeout: fusion.fused_timeout,
            late_results_dropped: fusion.late_dropped,
            cache_entries: self.detection_cache.len(),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_hit_rate: cache.hit_rate(),
            in_flight: self.workers.in_flight(),
        }
    }
}

/// Builder for [`PipelineContext`].
///
/// All four models are required; a missing one fails `build` instead of
/// degrading the pipeline.
///
/// ```ignore
/// let ctx = PipelineBuilder::new(PipelineConfig::from_env())
///     .with_person_detector(person)
///     .with_compliance_detector(compliance)
///     .with_pose_estimator(pose)
///     .with_action_classifier(action)
///     .build()?;
/// let mut orchestrator = ctx.orchestrator("cam-1");
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    person: Option<Arc<dyn PersonDetector>>,
    compliance: Option<Arc<dyn ComplianceObjectDetector>>,
    pose: Option<Arc<dyn PoseEstimator>>,
    action: Option<Arc<dyn ActionClassifier>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            person: None,
            compliance: None,
            pose: None,
            action: None,
        }
    }

    pub fn with_person_detector(mut self, model: Arc<dyn PersonDetector>) -> Self {
        self.person = Some(model);
        self
    }

    pub fn with_compliance_detector(mut self, model: Arc<dyn ComplianceObjectDetector>) -> Self {
        self.compliance = Some(model);
        self
    }

    pub fn with_pose_estimator(mut self, model: Arc<dyn PoseEstimator>) -> Self {
        self.pose = Some(model);
        self
    }

    pub fn with_action_classifier(mut self, model: Arc<dyn ActionClassifier>) -> Self {
        self.action = Some(model);
        self
    }

    /// Validate the configuration and wire the shared components.
    pub fn build(self) -> PipelineResult<Arc<PipelineContext>> {
        self.config.validate()?;

        let models = Models {
            person: self.person.ok_or(PipelineError::MissingModel("person detector"))?,
            compliance: self
                .compliance
                .ok_or(PipelineError::MissingModel("compliance object detector"))?,
            pose: self.pose.ok_or(PipelineError::MissingModel("pose estimator"))?,
            action: self.action.ok_or(PipelineError::MissingModel("action classifier"))?,
        };

        info!(
            person = models.person.name(),
            compliance = models.compliance.name(),
            pose = models.pose.name(),
            action = models.action.name(),
            "Building detection pipeline"
        );

        let config = self.config;
        let stats = Arc::new(PipelineStats::new());
        let manager = Arc::new(FrameMetadataManager::new(config.metadata.clone()));
        let sync_cache = Arc::new(SynchronizedCache::new(config.sync.clone()));
        let detection_cache = Arc::new(DetectionCache::new(config.detection_cache.clone()));
        let workers = AsyncDetectionPipeline::new(
            config.workers.clone(),
            Arc::clone(&manager),
            Arc::clone(&sync_cache),
            Arc::clone(&stats),
        );

        info!(
            max_concurrency = config.workers.max_concurrency,
            max_queue_depth = config.workers.max_queue_depth,
            stage_timeout_ms = config.workers.stage_timeout.as_millis() as u64,
            join_timeout_ms = config.sync.join_timeout.as_millis() as u64,
            conditions = ?config.conditions(),
            "Detection pipeline ready"
        );

        Ok(Arc::new(PipelineContext {
            config,
            manager,
            sync_cache,
            detection_cache,
            workers,
            roi: Arc::new(RoiBatchExtractor::new()),
            stats,
            models,
        }))
    }
}
