//! Per-camera frame orchestration.
//!
//! # Flow
//!
//! 1. Skip gate ([`FrameSkipDetector`]).
//! 2. Fingerprint cache lookup; a hit replays cached stage results.
//! 3. Person detection, confidence filtering and IoU tracking.
//! 4. Compliance-object and pose inference on person crops, in parallel,
//!    joined by the [`SynchronizedCache`].
//! 5. Keypoint smoothing and action classification on consistent tracks.
//! 6. Stability state update and event emission.
//! 7. Metadata hand-off.
//!
//! Zero persons mark the downstream stages not applicable without touching
//! the ROI extractor. A failed person stage marks them failed and leaves the
//! state machines untouched.

mod context;
mod signals;

pub use context::{Diagnostics, Models, PipelineBuilder, PipelineContext, SweepReport};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cwatch_models::{
    ActionPrediction, ComplianceEvent, ComplianceObject, Condition, FailureKind, FrameId,
    Keypoint, PersonAction, PersonCompliance, PersonDetection, PersonPose, PoseSequence,
    SlotStatus, Stage, StageOutcome, StageOutput, StageSlot, TrackId, TrackedPerson,
};
use tracing::{debug, warn};

use crate::async_pipeline::StageTask;
use crate::error::{PipelineError, PipelineResult, StageError};
use crate::fingerprint::Fingerprint;
use crate::frame::Frame;
use crate::frame_skip::FrameSkipDetector;
use crate::metadata::FrameMetadata;
use crate::metrics;
use crate::providers::{ActionClassifier, ComplianceObjectDetector, PoseEstimator};
use crate::roi::RoiBatch;
use crate::smoother::TemporalSmoother;
use crate::state_manager::{StateManager, TrackObservation, TrackUpdate};
use crate::sync_cache::SynchronizedCache;
use crate::tracker::IoUTracker;
use signals::FrameEvidence;

/// Stages joined by the fusion cache.
const FUSED_STAGES: [Stage; 2] = [Stage::ComplianceObject, Stage::Pose];

/// What happened to one ingested frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Dropped by the skip gate; no metadata was created
    Skipped(Frame),
    /// Stage results replayed from the fingerprint cache
    Cached { metadata: FrameMetadata },
    /// Fully processed
    Processed {
        metadata: FrameMetadata,
        events: Vec<ComplianceEvent>,
    },
}

impl FrameOutcome {
    pub fn metadata(&self) -> Option<&FrameMetadata> {
        match self {
            Self::Skipped(_) => None,
            Self::Cached { metadata } | Self::Processed { metadata, .. } => Some(metadata),
        }
    }

    pub fn events(&self) -> &[ComplianceEvent] {
        match self {
            Self::Processed { events, .. } => events,
            _ => &[],
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Cached { .. } => "cached",
            Self::Processed { .. } => "processed",
        }
    }
}

/// Sequential frame processor for one camera.
///
/// Frames must be fed in capture order from a single task; the shared
/// components in [`PipelineContext`] take care of cross-stream concurrency.
pub struct Orchestrator {
    camera_id: String,
    ctx: Arc<PipelineContext>,
    frame_skip: FrameSkipDetector,
    tracker: IoUTracker,
    smoother: TemporalSmoother,
    states: StateManager,
    conditions: Vec<Condition>,
}

impl Orchestrator {
    pub(crate) fn new(camera_id: String, ctx: Arc<PipelineContext>) -> Self {
        let config = ctx.config();
        Self {
            frame_skip: FrameSkipDetector::new(config.frame_skip.clone()),
            tracker: IoUTracker::new(config.tracker.clone()),
            smoother: TemporalSmoother::new(config.smoother.clone()),
            states: StateManager::new(camera_id.clone(), config.stability.clone()),
            conditions: config.conditions(),
            camera_id,
            ctx,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    pub fn frame_skip(&self) -> &FrameSkipDetector {
        &self.frame_skip
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Run one frame through the pipeline.
    ///
    /// Stage failures never surface here; they are recorded in the frame's
    /// stage results. An error means the frame's metadata was lost (evicted
    /// under memory pressure) or the frame belongs to another camera.
    pub async fn process(&mut self, frame: Frame) -> PipelineResult<FrameOutcome> {
        if frame.camera_id != self.camera_id {
            return Err(PipelineError::CameraMismatch {
                expected: self.camera_id.clone(),
                actual: frame.camera_id,
            });
        }

        let started = Instant::now();
        let ctx = Arc::clone(&self.ctx);
        ctx.stats().record_received();

        if !self.frame_skip.should_process(&frame) {
            ctx.stats().record_skipped();
            metrics::record_frame(&self.camera_id, "skipped");
            return Ok(FrameOutcome::Skipped(frame));
        }

        let fingerprint = Fingerprint::compute(&frame.handle);
        if let Some(entry) = ctx.detection_cache().lookup(&self.camera_id, &fingerprint) {
            let frame_id = ctx.manager().create(&frame, true);
            for outcome in entry.result.outcomes() {
                self.record(frame_id, outcome, None);
            }
            let metadata = ctx
                .manager()
                .evict(frame_id)
                .ok_or(PipelineError::UnknownFrame(frame_id))?;

            ctx.stats().record_cached();
            metrics::record_frame(&self.camera_id, "cached");
            debug!(camera_id = %self.camera_id, frame_id, "Stage results replayed from cache");
            return Ok(FrameOutcome::Cached { metadata });
        }

        let frame_id = ctx.manager().create(&frame, false);
        let events = match self.detect_persons(frame_id, &frame).await {
            Some(persons) if persons.is_empty() => {
                for stage in Stage::DOWNSTREAM {
                    self.record(frame_id, StageOutcome::NotApplicable(stage), None);
                }
                self.states.update_frame(frame_id, Vec::new())
            }
            Some(persons) => self.process_persons(frame_id, &frame, &persons).await?,
            None => Vec::new(),
        };

        let active: HashSet<TrackId> = self.states.track_ids().into_iter().collect();
        self.smoother.retain_tracks(&active);

        let metadata = ctx
            .manager()
            .evict(frame_id)
            .ok_or(PipelineError::UnknownFrame(frame_id))?;
        if !metadata.stage_results().has_failures() {
            ctx.detection_cache().insert(
                &self.camera_id,
                fingerprint,
                metadata.stage_results().clone(),
            );
        }

        let elapsed = started.elapsed();
        for event in &events {
            ctx.stats().record_event(event.event_type);
        }
        ctx.stats().record_processed(elapsed);
        metrics::record_frame(&self.camera_id, "processed");
        metrics::record_frame_duration(&self.camera_id, elapsed);
        debug!(
            camera_id = %self.camera_id,
            frame_id,
            events = events.len(),
            failed = ?metadata.stage_results().failed_stages(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Frame processed"
        );

        Ok(FrameOutcome::Processed { metadata, events })
    }

    /// Primary detection. Returns `None` when the stage failed, after
    /// marking every downstream stage failed.
    async fn detect_persons(
        &mut self,
        frame_id: FrameId,
        frame: &Frame,
    ) -> Option<Vec<TrackedPerson>> {
        let ctx = Arc::clone(&self.ctx);
        let call = ctx
            .workers()
            .call(Stage::Person, ctx.models().person.detect(&frame.handle))
            .await;

        match call.result {
            Ok(detections) => {
                let threshold = ctx.config().thresholds.person;
                let person_class = ctx.config().person_class_id;
                let total = detections.len();
                let kept: Vec<PersonDetection> = detections
                    .into_iter()
                    .filter(|d| d.class_id == person_class && d.confidence >= threshold)
                    .collect();
                if kept.len() < total {
                    debug!(frame_id, total, kept = kept.len(), "Detections filtered");
                }
                let persons = self.tracker.update(&kept);
                self.record(
                    frame_id,
                    StageOutcome::Completed(StageOutput::Person(persons.clone())),
                    Some(call.elapsed),
                );
                Some(persons)
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id, frame_id, error = %e, "Person detection failed");
                self.record(
                    frame_id,
                    StageOutcome::Failed {
                        stage: Stage::Person,
                        failure: e.failure(),
                    },
                    Some(call.elapsed),
                );
                for stage in Stage::DOWNSTREAM {
                    self.record(
                        frame_id,
                        StageOutcome::failed(
                            stage,
                            FailureKind::DependencyUnavailable,
                            "person detection failed",
                        ),
                        None,
                    );
                }
                None
            }
        }
    }

    async fn process_persons(
        &mut self,
        frame_id: FrameId,
        frame: &Frame,
        persons: &[TrackedPerson],
    ) -> PipelineResult<Vec<ComplianceEvent>> {
        let ctx = Arc::clone(&self.ctx);
        let config = ctx.config();

        let boxes: Vec<_> = persons.iter().map(|p| p.bbox).collect();
        let track_ids: Arc<Vec<TrackId>> = Arc::new(persons.iter().map(|p| p.track_id).collect());
        let roi = Arc::clone(ctx.roi());
        let handle = frame.handle.clone();
        let sizes = [config.compliance_roi_size, config.pose_roi_size];
        let extracted =
            tokio::task::spawn_blocking(move || roi.extract_many(&handle, &boxes, &sizes)).await;

        match extracted.map(|batches| <[RoiBatch; 2]>::try_from(batches)) {
            Ok(Ok([compliance_batch, pose_batch])) => {
                ctx.stats().record_roi_batch();
                ctx.stats().record_roi_batch();
                self.run_fused_stages(frame_id, compliance_batch, pose_batch, track_ids)
                    .await;
            }
            Ok(Err(batches)) => {
                self.fail_fused_stages(
                    frame_id,
                    FailureKind::Error,
                    format!("expected 2 ROI batches, got {}", batches.len()),
                );
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id, frame_id, error = %e, "ROI extraction failed");
                self.fail_fused_stages(frame_id, FailureKind::Panicked, e.to_string());
            }
        }

        let snapshot = ctx
            .manager()
            .get(frame_id)
            .ok_or(PipelineError::UnknownFrame(frame_id))?;
        let mut smoothed: HashMap<TrackId, Vec<Keypoint>> = HashMap::new();
        match &snapshot.stage_results().pose {
            StageSlot::Present(poses) => {
                for pose in poses {
                    let keypoints = self.smoother.update(pose.track_id, &pose.keypoints);
                    smoothed.insert(pose.track_id, keypoints);
                }
                self.classify_actions(frame_id, poses).await;
            }
            _ => self.record(
                frame_id,
                StageOutcome::failed(
                    Stage::Action,
                    FailureKind::DependencyUnavailable,
                    "pose unavailable",
                ),
                None,
            ),
        }

        let snapshot = ctx
            .manager()
            .get(frame_id)
            .ok_or(PipelineError::UnknownFrame(frame_id))?;
        let results = snapshot.stage_results();
        let evidence = FrameEvidence {
            compliance: &results.compliance_object,
            action: &results.action,
        };
        let updates: Vec<TrackUpdate> = persons
            .iter()
            .map(|person| TrackUpdate {
                track_id: person.track_id,
                observation: TrackObservation {
                    frame_id,
                    bbox: Some(person.bbox),
                    keypoints: smoothed.get(&person.track_id).cloned(),
                    compliance_objects: results.compliance_object.present().and_then(|list| {
                        list.iter()
                            .find(|pc| pc.track_id == person.track_id)
                            .map(|pc| pc.objects.clone())
                    }),
                },
                signals: evidence.signals(person.track_id, &self.conditions, &config.thresholds),
            })
            .collect();

        Ok(self.states.update_frame(frame_id, updates))
    }

    /// Submit compliance-object and pose inference and wait for their fusion.
    async fn run_fused_stages(
        &self,
        frame_id: FrameId,
        compliance_batch: RoiBatch,
        pose_batch: RoiBatch,
        track_ids: Arc<Vec<TrackId>>,
    ) {
        let ctx = Arc::clone(&self.ctx);
        ctx.sync_cache().expect(frame_id, &FUSED_STAGES);
        let compliance_model = Arc::clone(&ctx.models().compliance);
        let pose_model = Arc::clone(&ctx.models().pose);
        let compliance_batch = Arc::new(compliance_batch);
        let pose_batch = Arc::new(pose_batch);
        let compliance_ids = Arc::clone(&track_ids);
        let tasks = vec![
            StageTask::new(Stage::ComplianceObject, move || {
                detect_compliance(compliance_model, compliance_batch, compliance_ids)
            }),
            StageTask::new(Stage::Pose, move || {
                estimate_poses(pose_model, pose_batch, track_ids)
            }),
        ];
        // Tasks that miss the join deadline keep running; their late results
        // are discarded by the write-once slots.
        let _run = ctx.workers().run_parallel(frame_id, tasks);
        let fused = ctx.sync_cache().wait_fused(frame_id).await;
        self.record_join_timeouts(frame_id, ctx.sync_cache());
        if let Some(fused) = &fused {
            if fused.timed_out {
                debug!(frame_id, missing = ?fused.missing, "Fused with stages missing");
            }
        }
    }

    /// Mark the fused stages failed when their inputs could not be built.
    fn fail_fused_stages(&self, frame_id: FrameId, kind: FailureKind, message: String) {
        for stage in FUSED_STAGES {
            self.record(frame_id, StageOutcome::failed(stage, kind, message.clone()), None);
        }
    }

    /// Classify actions for tracks whose smoothed motion is consistent.
    /// Jittery tracks get no action evidence for this frame.
    async fn classify_actions(&self, frame_id: FrameId, poses: &[PersonPose]) {
        let sequences: Vec<PoseSequence> = poses
            .iter()
            .filter(|p| self.smoother.is_consistent(p.track_id))
            .filter_map(|p| self.smoother.window(p.track_id))
            .collect();

        if sequences.is_empty() {
            self.record(frame_id, StageOutcome::NotApplicable(Stage::Action), None);
            return;
        }

        let model = Arc::clone(&self.ctx.models().action);
        let task = StageTask::new(Stage::Action, move || classify(model, sequences));
        self.ctx.workers().run_single(frame_id, task).await;
    }

    /// Mark fused stages that never arrived as failed.
    fn record_join_timeouts(&self, frame_id: FrameId, sync_cache: &SynchronizedCache) {
        let join_timeout = sync_cache.config().join_timeout;
        for stage in FUSED_STAGES {
            if self.ctx.manager().stage_status(frame_id, stage) != Some(SlotStatus::NotComputed) {
                continue;
            }
            let outcome = StageOutcome::failed(
                stage,
                FailureKind::JoinTimeout,
                format!("no result within {}ms", join_timeout.as_millis()),
            );
            // A result landing between the check and this write wins.
            if self.ctx.manager().record_stage(frame_id, outcome, None).is_ok() {
                self.ctx.stats().record_join_timeout();
                self.ctx.stats().record_stage_failure(stage);
                metrics::record_stage_failure(stage, FailureKind::JoinTimeout);
            }
        }
    }

    /// Record an outcome produced outside the worker pool.
    fn record(&self, frame_id: FrameId, outcome: StageOutcome, elapsed: Option<Duration>) {
        let stage = outcome.stage();
        let failure_kind = outcome.failure_kind();
        match self.ctx.manager().record_stage(frame_id, outcome, elapsed) {
            Ok(()) => {
                if let Some(kind) = failure_kind {
                    self.ctx.stats().record_stage_failure(stage);
                    metrics::record_stage_failure(stage, kind);
                }
            }
            Err(e) => debug!(frame_id, stage = %stage, error = %e, "Stage outcome not recorded"),
        }
    }
}

async fn detect_compliance(
    model: Arc<dyn ComplianceObjectDetector>,
    batch: Arc<RoiBatch>,
    track_ids: Arc<Vec<TrackId>>,
) -> Result<StageOutput, StageError> {
    let results = model.infer(&batch).await?;
    StageError::check_len(batch.len(), results.len())?;

    let persons = batch
        .mappings
        .iter()
        .zip(results)
        .map(|(mapping, objects)| PersonCompliance {
            track_id: track_ids[mapping.source_index],
            objects: objects
                .into_iter()
                .map(|object| ComplianceObject {
                    bbox: mapping.map_rect(&object.bbox),
                    ..object
                })
                .collect(),
        })
        .collect();
    Ok(StageOutput::ComplianceObject(persons))
}

async fn estimate_poses(
    model: Arc<dyn PoseEstimator>,
    batch: Arc<RoiBatch>,
    track_ids: Arc<Vec<TrackId>>,
) -> Result<StageOutput, StageError> {
    let estimates = model.infer(&batch).await?;
    StageError::check_len(batch.len(), estimates.len())?;

    let poses = batch
        .mappings
        .iter()
        .zip(estimates)
        .map(|(mapping, estimate)| PersonPose {
            track_id: track_ids[mapping.source_index],
            keypoints: estimate
                .keypoints
                .iter()
                .map(|k| mapping.map_keypoint(k))
                .collect(),
        })
        .collect();
    Ok(StageOutput::Pose(poses))
}

async fn classify(
    model: Arc<dyn ActionClassifier>,
    sequences: Vec<PoseSequence>,
) -> Result<StageOutput, StageError> {
    let predictions: Vec<Vec<ActionPrediction>> = model.infer(&sequences).await?;
    StageError::check_len(sequences.len(), predictions.len())?;

    Ok(StageOutput::Action(
        sequences
            .iter()
            .zip(predictions)
            .map(|(sequence, predictions)| PersonAction {
                track_id: sequence.track_id,
                predictions,
            })
            .collect(),
    ))
}
