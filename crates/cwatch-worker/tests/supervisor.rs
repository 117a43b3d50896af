//! Supervisor runs over in-memory models, channel sources and image directories.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cwatch_models::{
    ActionPrediction, BoundingBox, ComplianceEvent, ComplianceObject, FrameRecord, Keypoint,
    PersonDetection, PoseEstimate, PoseSequence,
};
use cwatch_pipeline::{
    ActionClassifier, ComplianceObjectDetector, FrameHandle, PersonDetector, PipelineBuilder,
    PipelineConfig, PipelineContext, PoseEstimator, RoiBatch, StageError,
};
use cwatch_worker::{
    ChannelSink, ChannelSource, DirectorySource, OutputSink, SinkMessage, StopReason,
    StreamSupervisor, WorkerConfig, WorkerError, WorkerResult,
};
use image::{Rgb, RgbImage};
use tokio::sync::mpsc;

struct OnePerson;

#[async_trait]
impl PersonDetector for OnePerson {
    async fn detect(&self, _frame: &FrameHandle) -> Result<Vec<PersonDetection>, StageError> {
        Ok(vec![PersonDetection::new(BoundingBox::new(4.0, 4.0, 16.0, 24.0), 0.9)])
    }

    fn name(&self) -> &'static str {
        "one-person"
    }
}

struct Hairnets;

/// Reports hairnets so faint that every person counts as missing one.
struct FaintHairnets;

#[async_trait]
impl ComplianceObjectDetector for FaintHairnets {
    async fn infer(&self, batch: &RoiBatch) -> Result<Vec<Vec<ComplianceObject>>, StageError> {
        let (w, h) = batch.target_size;
        Ok((0..batch.len())
            .map(|_| {
                vec![ComplianceObject {
                    label: "hairnet".into(),
                    bbox: BoundingBox::new(0.0, 0.0, w as f64, h as f64 / 3.0),
                    confidence: 0.05,
                }]
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "faint-hairnets"
    }
}

/// Rejects every event but keeps frame records.
#[derive(Default)]
struct EventRejectingSink {
    frames: AtomicU64,
}

#[async_trait]
impl OutputSink for EventRejectingSink {
    async fn on_frame(&self, _record: FrameRecord) -> WorkerResult<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_event(&self, _event: ComplianceEvent) -> WorkerResult<()> {
        Err(WorkerError::sink_failed("event store offline"))
    }

    fn name(&self) -> &'static str {
        "event-rejecting"
    }
}

#[async_trait]
impl ComplianceObjectDetector for Hairnets {
    async fn infer(&self, batch: &RoiBatch) -> Result<Vec<Vec<ComplianceObject>>, StageError> {
        let (w, h) = batch.target_size;
        Ok((0..batch.len())
            .map(|_| {
                vec![ComplianceObject {
                    label: "hairnet".into(),
                    bbox: BoundingBox::new(0.0, 0.0, w as f64, h as f64 / 3.0),
                    confidence: 0.9,
                }]
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "hairnets"
    }
}

struct CenterPose;

#[async_trait]
impl PoseEstimator for CenterPose {
    async fn infer(&self, batch: &RoiBatch) -> Result<Vec<PoseEstimate>, StageError> {
        let (w, h) = batch.target_size;
        Ok((0..batch.len())
            .map(|_| PoseEstimate {
                keypoints: vec![Keypoint::new(w as f64 / 2.0, h as f64 / 2.0, 0.8)],
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "center-pose"
    }
}

struct Idle;

#[async_trait]
impl ActionClassifier for Idle {
    async fn infer(
        &self,
        sequences: &[PoseSequence],
    ) -> Result<Vec<Vec<ActionPrediction>>, StageError> {
        Ok(sequences
            .iter()
            .map(|_| {
                vec![ActionPrediction {
                    label: "hand_washing".into(),
                    confidence: 0.1,
                }]
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "idle"
    }
}

fn context(pipeline: PipelineConfig) -> Arc<PipelineContext> {
    PipelineBuilder::new(pipeline)
        .with_person_detector(Arc::new(OnePerson))
        .with_compliance_detector(Arc::new(Hairnets))
        .with_pose_estimator(Arc::new(CenterPose))
        .with_action_classifier(Arc::new(Idle))
        .build()
        .unwrap()
}

fn uncached_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.pipeline.frame_skip.skip_interval = 1;
    config.pipeline.detection_cache.ttl = Duration::ZERO;
    config.sweep_interval = Duration::from_millis(20);
    config
}

fn image(level: u8) -> RgbImage {
    RgbImage::from_pixel(32, 32, Rgb([level, level, level]))
}

fn drain(rx: &mut mpsc::Receiver<SinkMessage>) -> Vec<SinkMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_cameras_processed_independently() {
    let config = uncached_config();
    let (sink, mut rx) = ChannelSink::new(64);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));
    supervisor.start_sweeper();

    let mut handles = Vec::new();
    for camera in ["cam-a", "cam-b"] {
        let (source, handle) = ChannelSource::new(camera, config.ingest_capacity);
        supervisor.add_stream(Box::new(source)).unwrap();
        handles.push(handle);
    }
    assert_eq!(supervisor.cameras(), vec!["cam-a", "cam-b"]);

    for level in [10u8, 20, 30] {
        for handle in &handles {
            assert!(handle.try_push(image(level)));
        }
    }
    drop(handles);

    let summaries = supervisor.wait().await;
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert_eq!(summary.stop_reason, StopReason::Exhausted);
        assert_eq!(summary.frames_received, 3);
        assert_eq!(summary.frames_processed, 3);
        assert_eq!(summary.pipeline_errors, 0);
    }

    let records: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|m| match m {
            SinkMessage::Frame(record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 6);
    for camera in ["cam-a", "cam-b"] {
        let ids: Vec<_> = records
            .iter()
            .filter(|r| r.camera_id == camera)
            .map(|r| r.frame_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "{camera} out of order: {ids:?}");
    }
    assert!(records.iter().all(|r| !r.from_cache));
}

#[tokio::test]
async fn test_gated_frames_forwarded_as_previews() {
    let mut config = WorkerConfig::default();
    config.pipeline.detection_cache.ttl = Duration::ZERO;
    let (sink, mut rx) = ChannelSink::new(64);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));

    let (source, handle) = ChannelSource::new("cam-1", 32);
    supervisor.add_stream(Box::new(source)).unwrap();
    for _ in 0..10 {
        handle.try_push(image(50));
    }
    drop(handle);

    let summaries = supervisor.wait().await;
    assert_eq!(summaries[0].frames_skipped, 8);
    assert_eq!(summaries[0].frames_processed, 2);

    let previews = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, SinkMessage::Preview { camera_id, .. } if camera_id == "cam-1"))
        .count();
    assert_eq!(previews, 8);
}

#[tokio::test]
async fn test_duplicate_camera_rejected() {
    let config = uncached_config();
    let (sink, _rx) = ChannelSink::new(4);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));

    let (first, _h1) = ChannelSource::new("cam-1", 4);
    let (second, _h2) = ChannelSource::new("cam-1", 4);
    supervisor.add_stream(Box::new(first)).unwrap();
    assert!(matches!(
        supervisor.add_stream(Box::new(second)),
        Err(WorkerError::DuplicateStream(id)) if id == "cam-1"
    ));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_idle_streams() {
    let config = uncached_config();
    let (sink, _rx) = ChannelSink::new(4);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));
    supervisor.start_sweeper();

    // Handle stays alive, so the source never ends on its own.
    let (source, _handle) = ChannelSource::new("cam-1", 4);
    supervisor.add_stream(Box::new(source)).unwrap();

    let summaries = supervisor.shutdown().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].stop_reason, StopReason::Shutdown);
    assert_eq!(summaries[0].frames_received, 0);
}

#[tokio::test]
async fn test_directory_replay() {
    let dir = tempfile::tempdir().unwrap();
    for (i, level) in [0u8, 120, 240].into_iter().enumerate() {
        image(level).save(dir.path().join(format!("frame_{i:03}.png"))).unwrap();
    }

    let config = uncached_config();
    let (sink, mut rx) = ChannelSink::new(32);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));
    supervisor
        .add_stream(Box::new(DirectorySource::new("replay", dir.path()).unwrap()))
        .unwrap();

    let summaries = supervisor.wait().await;
    assert_eq!(summaries[0].frames_processed, 3);
    assert_eq!(summaries[0].source_errors, 0);

    let frames = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, SinkMessage::Frame(_)))
        .count();
    assert_eq!(frames, 3);
}

#[tokio::test]
async fn test_stream_stops_after_consecutive_source_errors() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..4 {
        std::fs::write(dir.path().join(format!("bad_{i}.png")), b"garbage").unwrap();
    }

    let mut config = uncached_config();
    config.max_consecutive_source_errors = 2;
    let (sink, _rx) = ChannelSink::new(8);
    let mut supervisor =
        StreamSupervisor::new(config.clone(), context(config.pipeline.clone()), Arc::new(sink));
    supervisor
        .add_stream(Box::new(DirectorySource::new("replay", dir.path()).unwrap()))
        .unwrap();

    let summaries = supervisor.wait().await;
    assert_eq!(summaries[0].stop_reason, StopReason::SourceErrors);
    assert_eq!(summaries[0].source_errors, 2);
    assert_eq!(summaries[0].frames_received, 0);
}

#[tokio::test]
async fn test_failed_event_write_does_not_drop_frame_record() {
    let config = uncached_config();
    let ctx = PipelineBuilder::new(config.pipeline.clone())
        .with_person_detector(Arc::new(OnePerson))
        .with_compliance_detector(Arc::new(FaintHairnets))
        .with_pose_estimator(Arc::new(CenterPose))
        .with_action_classifier(Arc::new(Idle))
        .build()
        .unwrap();
    let sink = Arc::new(EventRejectingSink::default());
    let mut supervisor = StreamSupervisor::new(config.clone(), ctx, sink.clone());

    let (source, handle) = ChannelSource::new("cam-1", 8);
    supervisor.add_stream(Box::new(source)).unwrap();
    for level in [10u8, 20, 30] {
        assert!(handle.try_push(image(level)));
    }
    drop(handle);

    let summaries = supervisor.wait().await;
    assert_eq!(summaries[0].frames_processed, 3);
    assert_eq!(summaries[0].events_emitted, 1);
    assert_eq!(summaries[0].sink_errors, 1);
    assert_eq!(sink.frames.load(Ordering::SeqCst), 3);
}
