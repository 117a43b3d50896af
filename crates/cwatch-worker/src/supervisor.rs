//! Stream supervisor: one ingest task per camera over a shared pipeline.

use std::sync::Arc;

use cwatch_pipeline::{FrameOutcome, Orchestrator, PipelineContext};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::StreamLogger;
use crate::sink::OutputSink;
use crate::source::FrameSource;

const ACTIVE_STREAMS: &str = "cwatch_active_streams";
const SOURCE_ERRORS_TOTAL: &str = "cwatch_source_errors_total";
const SINK_ERRORS_TOTAL: &str = "cwatch_sink_errors_total";

/// Why a stream task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Source ran out of frames
    Exhausted,
    /// Shutdown was requested
    Shutdown,
    /// Too many source errors in a row
    SourceErrors,
    /// Task was aborted after the shutdown timeout
    Aborted,
}

/// Per-stream counters reported when the stream stops.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub camera_id: String,
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub frames_cached: u64,
    pub frames_processed: u64,
    pub events_emitted: u64,
    pub pipeline_errors: u64,
    pub source_errors: u64,
    pub sink_errors: u64,
    pub stop_reason: StopReason,
}

impl StreamSummary {
    fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            frames_received: 0,
            frames_skipped: 0,
            frames_cached: 0,
            frames_processed: 0,
            events_emitted: 0,
            pipeline_errors: 0,
            source_errors: 0,
            sink_errors: 0,
            stop_reason: StopReason::Exhausted,
        }
    }
}

/// Runs camera streams against one [`PipelineContext`].
///
/// Each stream gets its own [`Orchestrator`] and task, so frames of one
/// camera stay ordered while cameras progress independently.
pub struct StreamSupervisor {
    config: WorkerConfig,
    ctx: Arc<PipelineContext>,
    sink: Arc<dyn OutputSink>,
    shutdown: watch::Sender<bool>,
    streams: Vec<(String, JoinHandle<StreamSummary>)>,
    sweeper: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(config: WorkerConfig, ctx: Arc<PipelineContext>, sink: Arc<dyn OutputSink>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            ctx,
            sink,
            shutdown,
            streams: Vec::new(),
            sweeper: None,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Camera ids of the streams started so far.
    pub fn cameras(&self) -> Vec<&str> {
        self.streams.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Spawn the ingest task for one camera.
    pub fn add_stream(&mut self, source: Box<dyn FrameSource>) -> WorkerResult<()> {
        let camera_id = source.camera_id().to_string();
        if self.streams.iter().any(|(id, _)| *id == camera_id) {
            return Err(WorkerError::DuplicateStream(camera_id));
        }

        let orchestrator = self.ctx.orchestrator(camera_id.clone());
        let logger = StreamLogger::new(&camera_id, "ingest");
        let span = logger.create_span();
        let task = run_stream(
            orchestrator,
            source,
            Arc::clone(&self.sink),
            self.shutdown.subscribe(),
            logger,
            self.config.clone(),
        );

        info!(camera_id = %camera_id, sink = self.sink.name(), "Stream added");
        self.streams
            .push((camera_id, tokio::spawn(task.instrument(span))));
        Ok(())
    }

    /// Start the periodic sweep of expired metadata, fusion entries and
    /// cache entries. Idempotent.
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.config.sweep_interval;

        self.sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let report = ctx.sweep();
                        if report.total() > 0 {
                            debug!(
                                metadata = report.metadata,
                                fusion = report.fusion,
                                detection_cache = report.detection_cache,
                                "Swept expired entries"
                            );
                        }
                    }
                }
            }
        }));
    }

    /// Signal every stream and the sweeper to stop.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for all streams to finish on their own (sources exhausted).
    pub async fn wait(mut self) -> Vec<StreamSummary> {
        let mut summaries = Vec::with_capacity(self.streams.len());
        for (camera_id, handle) in self.streams.drain(..) {
            summaries.push(join_stream(camera_id, handle).await);
        }
        self.stop_sweeper().await;
        summaries
    }

    /// Stop all streams, waiting up to the configured shutdown timeout.
    /// Streams still running after the timeout are aborted.
    pub async fn shutdown(mut self) -> Vec<StreamSummary> {
        info!(streams = self.streams.len(), "Shutting down streams");
        self.request_shutdown();

        let timeout = self.config.shutdown_timeout;
        let streams: Vec<_> = self.streams.drain(..).collect();
        let aborts: Vec<_> = streams
            .iter()
            .map(|(id, handle)| (id.clone(), handle.abort_handle()))
            .collect();

        let joined = tokio::time::timeout(
            timeout,
            futures::future::join_all(
                streams
                    .into_iter()
                    .map(|(camera_id, handle)| join_stream(camera_id, handle)),
            ),
        )
        .await;

        let summaries = match joined {
            Ok(summaries) => summaries,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Shutdown timed out, aborting streams");
                aborts
                    .into_iter()
                    .map(|(camera_id, abort)| {
                        abort.abort();
                        let mut summary = StreamSummary::new(&camera_id);
                        summary.stop_reason = StopReason::Aborted;
                        summary
                    })
                    .collect()
            }
        };

        self.stop_sweeper().await;
        info!("All streams stopped");
        summaries
    }

    async fn stop_sweeper(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
    }
}

async fn join_stream(camera_id: String, handle: JoinHandle<StreamSummary>) -> StreamSummary {
    match handle.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(camera_id = %camera_id, error = %e, "Stream task did not complete");
            let mut summary = StreamSummary::new(&camera_id);
            summary.stop_reason = StopReason::Aborted;
            summary
        }
    }
}

async fn run_stream(
    mut orchestrator: Orchestrator,
    mut source: Box<dyn FrameSource>,
    sink: Arc<dyn OutputSink>,
    mut shutdown_rx: watch::Receiver<bool>,
    logger: StreamLogger,
    config: WorkerConfig,
) -> StreamSummary {
    let mut summary = StreamSummary::new(orchestrator.camera_id());
    let mut consecutive_errors = 0u32;
    let camera_label = [("camera_id", logger.camera_id().to_string())];
    gauge!(ACTIVE_STREAMS).increment(1.0);
    logger.log_start("waiting for frames");

    loop {
        if *shutdown_rx.borrow_and_update() {
            summary.stop_reason = StopReason::Shutdown;
            break;
        }

        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    summary.stop_reason = StopReason::Shutdown;
                    break;
                }
                continue;
            }
            next = source.next_frame() => next,
        };

        let frame = match next {
            None => {
                summary.stop_reason = StopReason::Exhausted;
                break;
            }
            Some(Err(e)) => {
                summary.source_errors += 1;
                consecutive_errors += 1;
                counter!(SOURCE_ERRORS_TOTAL, &camera_label).increment(1);
                logger.log_warning(&format!("source error: {e}"));
                if consecutive_errors >= config.max_consecutive_source_errors {
                    logger.log_error(&format!(
                        "{consecutive_errors} source errors in a row, stopping"
                    ));
                    summary.stop_reason = StopReason::SourceErrors;
                    break;
                }
                continue;
            }
            Some(Ok(frame)) => {
                consecutive_errors = 0;
                frame
            }
        };
        summary.frames_received += 1;

        let outcome = match orchestrator.process(frame).await {
            Ok(outcome) => outcome,
            Err(e) => {
                summary.pipeline_errors += 1;
                logger.log_warning(&format!("frame dropped: {e}"));
                continue;
            }
        };

        let failed = deliver(&outcome, &*sink, &logger, &config, &mut summary).await;
        if failed > 0 {
            summary.sink_errors += failed;
            counter!(SINK_ERRORS_TOTAL, &camera_label).increment(failed);
        }
    }

    gauge!(ACTIVE_STREAMS).decrement(1.0);
    logger.log_completion(&format!(
        "{:?} after {} frames ({} processed, {} events)",
        summary.stop_reason,
        summary.frames_received,
        summary.frames_processed,
        summary.events_emitted
    ));
    summary
}

/// Hand one outcome to the sink. Every message is attempted even when an
/// earlier one fails; returns the number of failed writes.
async fn deliver(
    outcome: &FrameOutcome,
    sink: &dyn OutputSink,
    logger: &StreamLogger,
    config: &WorkerConfig,
    summary: &mut StreamSummary,
) -> u64 {
    let mut results = Vec::new();
    match outcome {
        FrameOutcome::Skipped(frame) => {
            summary.frames_skipped += 1;
            if config.forward_preview {
                results.push(sink.on_preview(&frame.camera_id, frame.handle.clone()).await);
            }
        }
        FrameOutcome::Cached { metadata } => {
            summary.frames_cached += 1;
            results.push(sink.on_frame(metadata.to_record()).await);
        }
        FrameOutcome::Processed { metadata, events } => {
            summary.frames_processed += 1;
            for event in events {
                logger.log_event(event);
                summary.events_emitted += 1;
                results.push(sink.on_event(event.clone()).await);
            }
            results.push(sink.on_frame(metadata.to_record()).await);
        }
    }

    let mut failed = 0;
    for e in results.into_iter().filter_map(Result::err) {
        failed += 1;
        logger.log_warning(&format!("sink {} failed: {e}", sink.name()));
    }
    failed
}
