//! Bounded worker pool for stage tasks.
//!
//! Stage tasks are admitted up to `max_concurrency + max_queue_depth`
//! in-flight calls; anything beyond is rejected immediately and recorded as
//! a `Rejected` failure, so ingest never blocks on a saturated pool. Admitted
//! calls wait for one of `max_concurrency` permits, then run under a
//! per-call timeout with panic isolation.
//!
//! Results of [`AsyncDetectionPipeline::run_parallel`] are written back to
//! the [`FrameMetadataManager`] and forwarded to the [`SynchronizedCache`].
//! A task created with [`StageTask::after`] starts only once its dependency
//! has been recorded, and receives the dependency's output.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cwatch_models::{FailureKind, FrameId, Stage, StageOutcome, StageOutput};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PipelineError, StageError};
use crate::metadata::FrameMetadataManager;
use crate::metrics::{self, PipelineStats};
use crate::sync_cache::SynchronizedCache;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent model calls
    pub max_concurrency: usize,
    /// Calls allowed to wait for a permit
    pub max_queue_depth: usize,
    /// Per-call timeout
    pub stage_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_queue_depth: 64,
            stage_timeout: Duration::from_millis(800),
        }
    }
}

type StageFuture = BoxFuture<'static, Result<StageOutput, StageError>>;

enum TaskBody {
    Independent(Box<dyn FnOnce() -> StageFuture + Send>),
    Dependent {
        dependency: Stage,
        run: Box<dyn FnOnce(StageOutput) -> StageFuture + Send>,
    },
}

/// One unit of stage work for a frame.
pub struct StageTask {
    stage: Stage,
    body: TaskBody,
}

impl StageTask {
    /// Task with no upstream dependency.
    pub fn new<F, Fut>(stage: Stage, make: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<StageOutput, StageError>> + Send + 'static,
    {
        Self {
            stage,
            body: TaskBody::Independent(Box::new(move || make().boxed())),
        }
    }

    /// Task that starts after `dependency` was recorded with an output.
    ///
    /// If the dependency failed or was not applicable, this task is recorded
    /// as failed with `DependencyUnavailable` without running.
    pub fn after<F, Fut>(stage: Stage, dependency: Stage, run: F) -> Self
    where
        F: FnOnce(StageOutput) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StageOutput, StageError>> + Send + 'static,
    {
        Self {
            stage,
            body: TaskBody::Dependent {
                dependency,
                run: Box::new(move |output| run(output).boxed()),
            },
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn dependency(&self) -> Option<Stage> {
        match &self.body {
            TaskBody::Independent(_) => None,
            TaskBody::Dependent { dependency, .. } => Some(*dependency),
        }
    }
}

/// Result of a guarded model call.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, StageError>,
    /// Time spent executing, excluding permit wait
    pub elapsed: Duration,
}

/// Outcome of one task in a [`PipelineRun`].
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

/// Handles of the tasks spawned by one `run_parallel` call.
pub struct PipelineRun {
    frame_id: FrameId,
    handles: Vec<(Stage, JoinHandle<StageReport>)>,
}

impl PipelineRun {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.handles.iter().map(|(s, _)| *s).collect()
    }

    /// Wait for every task of the run.
    pub async fn join(self) -> Vec<StageReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for (stage, handle) in self.handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(
                        frame_id = self.frame_id,
                        stage = %stage,
                        error = %e,
                        "Stage task aborted"
                    );
                    reports.push(StageReport {
                        stage,
                        outcome: StageOutcome::failed(stage, FailureKind::Panicked, e.to_string()),
                        elapsed: Duration::ZERO,
                    });
                }
            }
        }
        reports
    }
}

/// Releases an admission slot on drop.
struct Admission<'a>(&'a AtomicUsize);

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

type DependencySignal = Option<Option<StageOutput>>;

/// Bounded, panic-isolating executor for stage tasks.
#[derive(Clone)]
pub struct AsyncDetectionPipeline {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    manager: Arc<FrameMetadataManager>,
    sync_cache: Arc<SynchronizedCache>,
    stats: Arc<PipelineStats>,
}

impl AsyncDetectionPipeline {
    pub fn new(
        config: WorkerPoolConfig,
        manager: Arc<FrameMetadataManager>,
        sync_cache: Arc<SynchronizedCache>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            config,
            manager,
            sync_cache,
            stats,
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let limit = self.config.max_concurrency.max(1) + self.config.max_queue_depth;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Admission(&self.in_flight))
    }

    /// Run one model call under admission control, timeout and panic
    /// isolation. Nothing is recorded.
    pub async fn call<T, Fut>(&self, stage: Stage, fut: Fut) -> CallOutcome<T>
    where
        Fut: Future<Output = Result<T, StageError>> + Send,
    {
        let Some(_admission) = self.admit() else {
            self.stats.record_rejection();
            warn!(stage = %stage, "Worker pool saturated, stage task rejected");
            return CallOutcome {
                result: Err(StageError::Rejected),
                elapsed: Duration::ZERO,
            };
        };
        metrics::set_in_flight(self.in_flight.load(Ordering::Relaxed));

        let Ok(_permit) = self.semaphore.acquire().await else {
            return CallOutcome {
                result: Err(StageError::Rejected),
                elapsed: Duration::ZERO,
            };
        };

        let started = Instant::now();
        let timeout = self.config.stage_timeout;
        let result = match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await
        {
            Err(_) => Err(StageError::Timeout(timeout)),
            Ok(Err(_)) => Err(StageError::Panicked),
            Ok(Ok(result)) => result,
        };
        let elapsed = started.elapsed();

        metrics::record_stage_duration(stage, elapsed);
        if let Err(e) = &result {
            debug!(
                stage = %stage,
                error = %e,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stage call failed"
            );
        }
        CallOutcome { result, elapsed }
    }

    /// Spawn `tasks` for `frame_id` and return their handles.
    ///
    /// Independent tasks start immediately and run concurrently. Every
    /// task's outcome is recorded in the metadata manager before it is
    /// forwarded to the synchronized cache and to dependent tasks.
    pub fn run_parallel(&self, frame_id: FrameId, tasks: Vec<StageTask>) -> PipelineRun {
        let mut senders: HashMap<Stage, watch::Sender<DependencySignal>> = tasks
            .iter()
            .map(|t| (t.stage, watch::channel(None).0))
            .collect();
        let receivers: Vec<Option<watch::Receiver<DependencySignal>>> = tasks
            .iter()
            .map(|t| {
                t.dependency()
                    .and_then(|dep| senders.get(&dep).map(|tx| tx.subscribe()))
            })
            .collect();

        let handles = tasks
            .into_iter()
            .zip(receivers)
            .map(|(task, dep_rx)| {
                let stage = task.stage;
                let tx = senders.remove(&stage);
                let pool = self.clone();
                let handle = tokio::spawn(async move {
                    let report = pool.execute(frame_id, task, dep_rx, true).await;
                    if let Some(tx) = tx {
                        let _ = tx.send(Some(report.outcome.output().cloned()));
                    }
                    report
                });
                (stage, handle)
            })
            .collect();

        PipelineRun { frame_id, handles }
    }

    /// Run one independent task inline and record it without forwarding it
    /// to the synchronized cache (for stages that run after fusion).
    pub async fn run_single(&self, frame_id: FrameId, task: StageTask) -> StageReport {
        self.execute(frame_id, task, None, false).await
    }

    async fn execute(
        &self,
        frame_id: FrameId,
        task: StageTask,
        dep_rx: Option<watch::Receiver<DependencySignal>>,
        forward: bool,
    ) -> StageReport {
        let stage = task.stage;
        let call = match task.body {
            TaskBody::Independent(make) => self.call(stage, async move { make().await }).await,
            TaskBody::Dependent { dependency, run } => {
                let mut upstream = None;
                if let Some(mut rx) = dep_rx {
                    if let Ok(signal) = rx.wait_for(|signal| signal.is_some()).await {
                        upstream = signal.clone().flatten();
                    }
                }
                match upstream {
                    Some(output) => self.call(stage, async move { run(output).await }).await,
                    None => CallOutcome {
                        result: Err(StageError::DependencyUnavailable(dependency)),
                        elapsed: Duration::ZERO,
                    },
                }
            }
        };

        let outcome = match call.result {
            Ok(output) if output.stage() == stage => StageOutcome::Completed(output),
            Ok(output) => StageOutcome::failed(
                stage,
                FailureKind::InvalidOutput,
                format!("task returned {} output", output.stage()),
            ),
            Err(e) => StageOutcome::Failed {
                stage,
                failure: e.failure(),
            },
        };

        self.record(frame_id, outcome.clone(), call.elapsed, forward);
        StageReport {
            stage,
            outcome,
            elapsed: call.elapsed,
        }
    }

    /// Write an outcome back and optionally forward it to the fusion cache.
    fn record(&self, frame_id: FrameId, outcome: StageOutcome, elapsed: Duration, forward: bool) {
        let stage = outcome.stage();
        let failure_kind = outcome.failure_kind();

        match self
            .manager
            .record_stage(frame_id, outcome.clone(), Some(elapsed))
        {
            Ok(()) => {
                // Only outcomes that landed in the slot count as failures.
                if let Some(kind) = failure_kind {
                    self.stats.record_stage_failure(stage);
                    metrics::record_stage_failure(stage, kind);
                }
                if forward {
                    self.sync_cache
                        .put(frame_id, outcome, tokio::time::Instant::now());
                }
            }
            Err(PipelineError::UnknownFrame(_)) => {
                self.stats.record_unknown_frame();
                debug!(frame_id, stage = %stage, "Result for evicted frame discarded");
            }
            Err(PipelineError::StageAlreadyRecorded { .. }) => {
                debug!(frame_id, stage = %stage, "Result superseded by join timeout, discarded");
            }
            Err(e) => warn!(frame_id, stage = %stage, error = %e, "Failed to record stage result"),
        }
    }

    /// Calls currently admitted (running or waiting for a permit).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<FrameMetadataManager> {
        &self.manager
    }

    pub fn sync_cache(&self) -> &Arc<SynchronizedCache> {
        &self.sync_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use cwatch_models::{PersonCompliance, SlotStatus};
    use image::RgbImage;
    use std::sync::atomic::AtomicU32;

    fn pool(config: WorkerPoolConfig) -> AsyncDetectionPipeline {
        AsyncDetectionPipeline::new(
            config,
            Arc::new(FrameMetadataManager::default()),
            Arc::new(SynchronizedCache::default()),
            Arc::new(PipelineStats::default()),
        )
    }

    fn new_frame(pool: &AsyncDetectionPipeline) -> FrameId {
        pool.manager()
            .create(&Frame::new("cam", RgbImage::new(4, 4)), false)
    }

    #[tokio::test]
    async fn test_results_written_back_and_fused() {
        let pool = pool(WorkerPoolConfig::default());
        let frame_id = new_frame(&pool);
        pool.sync_cache()
            .expect(frame_id, &[Stage::ComplianceObject, Stage::Pose]);

        let tasks = vec![
            StageTask::new(Stage::ComplianceObject, || async {
                Ok(StageOutput::ComplianceObject(vec![PersonCompliance {
                    track_id: 1,
                    objects: vec![],
                }]))
            }),
            StageTask::new(Stage::Pose, || async {
                Err(StageError::inference("model offline"))
            }),
        ];
        let reports = pool.run_parallel(frame_id, tasks).join().await;
        assert_eq!(reports.len(), 2);

        let meta = pool.manager().get(frame_id).unwrap();
        assert_eq!(
            meta.stage_results().status(Stage::ComplianceObject),
            SlotStatus::Present
        );
        assert_eq!(
            meta.stage_results().status(Stage::Pose),
            SlotStatus::Failed(FailureKind::Error)
        );

        let fused = pool.sync_cache().wait_fused(frame_id).await.unwrap();
        assert!(fused.missing.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_and_panic_isolated() {
        let pool = pool(WorkerPoolConfig {
            stage_timeout: Duration::from_millis(20),
            ..Default::default()
        });

        let slow = pool
            .call(Stage::Pose, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StageError>(())
            })
            .await;
        assert!(matches!(slow.result, Err(StageError::Timeout(_))));

        let panicking = pool
            .call(Stage::Pose, async {
                if true {
                    panic!("model crashed");
                }
                Ok::<_, StageError>(())
            })
            .await;
        assert!(matches!(panicking.result, Err(StageError::Panicked)));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects_immediately() {
        let pool = pool(WorkerPoolConfig {
            max_concurrency: 1,
            max_queue_depth: 0,
            stage_timeout: Duration::from_secs(5),
        });

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.call(Stage::Person, async move {
                    let _ = release_rx.await;
                    Ok::<_, StageError>(())
                })
                .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let frame_id = new_frame(&pool);
        let reports = pool
            .run_parallel(
                frame_id,
                vec![StageTask::new(Stage::Pose, || async {
                    Ok(StageOutput::Pose(vec![]))
                })],
            )
            .join()
            .await;
        assert_eq!(
            pool.manager().stage_status(frame_id, Stage::Pose),
            Some(SlotStatus::Failed(FailureKind::Rejected))
        );
        assert!(matches!(reports[0].outcome, StageOutcome::Failed { .. }));

        let _ = release_tx.send(());
        assert!(busy.await.unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn test_dependent_task_receives_output() {
        let pool = pool(WorkerPoolConfig::default());
        let frame_id = new_frame(&pool);
        let seen = Arc::new(AtomicU32::new(0));

        let seen_in_task = Arc::clone(&seen);
        let tasks = vec![
            StageTask::after(Stage::Action, Stage::Pose, move |output| async move {
                if let StageOutput::Pose(poses) = output {
                    seen_in_task.store(poses.len() as u32 + 1, Ordering::SeqCst);
                }
                Ok(StageOutput::Action(vec![]))
            }),
            StageTask::new(Stage::Pose, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(StageOutput::Pose(vec![]))
            }),
        ];
        pool.run_parallel(frame_id, tasks).join().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.manager().stage_status(frame_id, Stage::Action),
            Some(SlotStatus::Present)
        );
    }

    #[tokio::test]
    async fn test_dependent_task_skipped_when_dependency_fails() {
        let pool = pool(WorkerPoolConfig::default());
        let frame_id = new_frame(&pool);
        let tasks = vec![
            StageTask::new(Stage::Pose, || async {
                Err(StageError::inference("no pose"))
            }),
            StageTask::after(Stage::Action, Stage::Pose, |_| async {
                Ok(StageOutput::Action(vec![]))
            }),
        ];
        pool.run_parallel(frame_id, tasks).join().await;

        assert_eq!(
            pool.manager().stage_status(frame_id, Stage::Action),
            Some(SlotStatus::Failed(FailureKind::DependencyUnavailable))
        );
    }

    #[tokio::test]
    async fn test_result_for_evicted_frame_discarded() {
        let pool = pool(WorkerPoolConfig::default());
        let frame_id = new_frame(&pool);
        pool.manager().evict(frame_id);

        let reports = pool
            .run_parallel(
                frame_id,
                vec![StageTask::new(Stage::Pose, || async {
                    Ok(StageOutput::Pose(vec![]))
                })],
            )
            .join()
            .await;
        assert_eq!(reports.len(), 1);
        assert!(pool.manager().get(frame_id).is_none());
        assert_eq!(pool.sync_cache().pending(), 0);
    }
}
