//! Per-frame fusion of asynchronously arriving stage results.
//!
//! Stage tasks `put` their outcomes as they finish, in any order. A frame is
//! *ready* once every required stage has arrived, or once `join_timeout`
//! has elapsed since the first arrival; the missing stages are reported
//! alongside. A ready frame is removed on delivery and its id is remembered
//! in a bounded log, so late arrivals are dropped and no frame is ever
//! delivered twice. Results for frames that were never registered with
//! [`SynchronizedCache::expect`] are dropped too.
//!
//! Entries and the delivered-id log are sharded by frame id; every
//! operation on a frame takes only that frame's shard lock.
//!
//! Waiting is a select-with-timeout over the entry's [`Notify`] handle.
//! Deadlines use `tokio::time::Instant` so they follow the runtime clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cwatch_models::{FrameId, Stage, StageOutcome};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct SyncCacheConfig {
    /// Maximum wait after the first arrival (default: 150ms)
    pub join_timeout: Duration,
    /// Maximum wait for the first arrival after registration
    pub arrival_timeout: Duration,
    pub shards: usize,
    /// Delivered frame ids remembered for late-arrival dropping, split
    /// evenly across shards
    pub fused_history: usize,
}

impl Default for SyncCacheConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_millis(150),
            arrival_timeout: Duration::from_secs(1),
            shards: 16,
            fused_history: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct Arrival {
    outcome: StageOutcome,
    arrived_at: Instant,
}

struct PendingEntry {
    registered_at: Instant,
    first_arrival: Option<Instant>,
    required: BTreeSet<Stage>,
    parts: BTreeMap<Stage, Arrival>,
    notify: Arc<Notify>,
}

impl PendingEntry {
    fn new(required: impl IntoIterator<Item = Stage>, now: Instant) -> Self {
        Self {
            registered_at: now,
            first_arrival: None,
            required: required.into_iter().collect(),
            parts: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn complete(&self) -> bool {
        self.required.iter().all(|s| self.parts.contains_key(s))
    }

    fn deadline(&self, config: &SyncCacheConfig) -> Instant {
        match self.first_arrival {
            Some(first) => first + config.join_timeout,
            None => self.registered_at + config.arrival_timeout,
        }
    }
}

/// Consolidated stage outcomes for one frame.
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub frame_id: FrameId,
    pub parts: BTreeMap<Stage, StageOutcome>,
    /// Required stages that had not arrived at fusion time
    pub missing: Vec<Stage>,
    /// Whether fusion was forced by the deadline
    pub timed_out: bool,
    pub fused_at: Instant,
}

impl FusedResult {
    pub fn get(&self, stage: Stage) -> Option<&StageOutcome> {
        self.parts.get(&stage)
    }
}

#[derive(Debug, Clone)]
pub enum FuseStatus {
    /// Delivered now; the entry is gone
    Ready(FusedResult),
    /// Still waiting for stages
    Pending,
    /// Never registered, already delivered, or swept
    Unknown,
}

/// Fusion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCacheStats {
    pub fused_complete: u64,
    pub fused_timeout: u64,
    pub late_dropped: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct FusedLog {
    ids: HashSet<FrameId>,
    order: VecDeque<FrameId>,
}

impl FusedLog {
    fn contains(&self, frame_id: FrameId) -> bool {
        self.ids.contains(&frame_id)
    }

    fn insert(&mut self, frame_id: FrameId, capacity: usize) {
        if self.ids.insert(frame_id) {
            self.order.push_back(frame_id);
            while self.order.len() > capacity.max(1) {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
    }
}

#[derive(Default)]
struct ShardState {
    entries: HashMap<FrameId, PendingEntry>,
    fused: FusedLog,
}

type Shard = Mutex<ShardState>;

/// Joins per-stage outcomes of the same frame.
pub struct SynchronizedCache {
    config: SyncCacheConfig,
    shards: Vec<Shard>,
    /// Delivered ids kept per shard
    fused_per_shard: usize,
    fused_complete: AtomicU64,
    fused_timeout: AtomicU64,
    late_dropped: AtomicU64,
    abandoned: AtomicU64,
}

impl SynchronizedCache {
    pub fn new(config: SyncCacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::default()).collect(),
            fused_per_shard: config.fused_history.div_ceil(shard_count).max(1),
            config,
            fused_complete: AtomicU64::new(0),
            fused_timeout: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    fn shard(&self, frame_id: FrameId) -> &Shard {
        &self.shards[(frame_id % self.shards.len() as u64) as usize]
    }

    /// Register the stages `frame_id` must wait for.
    pub fn expect(&self, frame_id: FrameId, stages: &[Stage]) {
        let mut shard = self.shard(frame_id).lock().unwrap_or_else(PoisonError::into_inner);
        if shard.fused.contains(frame_id) {
            warn!(frame_id, "expect() on an already delivered frame ignored");
            return;
        }
        shard
            .entries
            .entry(frame_id)
            .and_modify(|entry| entry.required = stages.iter().copied().collect())
            .or_insert_with(|| PendingEntry::new(stages.iter().copied(), Instant::now()));
    }

    /// Record one stage's outcome. Returns `false` when it was dropped
    /// (frame not registered, already delivered, or the stage already
    /// arrived).
    pub fn put(&self, frame_id: FrameId, outcome: StageOutcome, arrived_at: Instant) -> bool {
        let stage = outcome.stage();
        let mut shard = self.shard(frame_id).lock().unwrap_or_else(PoisonError::into_inner);

        if shard.fused.contains(frame_id) {
            self.late_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(frame_id, stage = %stage, "Late stage result dropped");
            return false;
        }

        let Some(entry) = shard.entries.get_mut(&frame_id) else {
            self.late_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(frame_id, stage = %stage, "Result for unregistered frame dropped");
            return false;
        };
        if entry.parts.contains_key(&stage) {
            debug!(frame_id, stage = %stage, "Duplicate stage result ignored");
            return false;
        }

        entry.parts.insert(stage, Arrival { outcome, arrived_at });
        entry.first_arrival = Some(match entry.first_arrival {
            Some(first) => first.min(arrived_at),
            None => arrived_at,
        });
        entry.notify.notify_one();
        true
    }

    /// Check readiness now.
    pub fn try_fuse(&self, frame_id: FrameId) -> FuseStatus {
        self.try_fuse_at(frame_id, Instant::now())
    }

    /// Check readiness as of `now`. A `Ready` result is returned exactly once.
    pub fn try_fuse_at(&self, frame_id: FrameId, now: Instant) -> FuseStatus {
        let mut shard = self.shard(frame_id).lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = shard.entries.get(&frame_id) else {
            return FuseStatus::Unknown;
        };

        let complete = entry.complete();
        if !complete && now < entry.deadline(&self.config) {
            return FuseStatus::Pending;
        }

        let Some(entry) = shard.entries.remove(&frame_id) else {
            return FuseStatus::Unknown;
        };
        shard.fused.insert(frame_id, self.fused_per_shard);
        drop(shard);

        let missing: Vec<Stage> = entry
            .required
            .iter()
            .filter(|s| !entry.parts.contains_key(s))
            .copied()
            .collect();
        let timed_out = !complete;
        if timed_out {
            self.fused_timeout.fetch_add(1, Ordering::Relaxed);
            metrics::record_fusion_timeout();
            warn!(frame_id, ?missing, "Fusion deadline reached with stages missing");
        } else {
            self.fused_complete.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(first) = entry.first_arrival {
            let spread = entry
                .parts
                .values()
                .map(|a| a.arrived_at.saturating_duration_since(first))
                .max()
                .unwrap_or_default();
            debug!(frame_id, spread_ms = spread.as_millis() as u64, "Frame fused");
        }

        FuseStatus::Ready(FusedResult {
            frame_id,
            parts: entry
                .parts
                .into_iter()
                .map(|(stage, arrival)| (stage, arrival.outcome))
                .collect(),
            missing,
            timed_out,
            fused_at: now,
        })
    }

    /// Wait until the frame is ready and return its fused result.
    ///
    /// Returns `None` for unknown or already delivered frames.
    pub async fn wait_fused(&self, frame_id: FrameId) -> Option<FusedResult> {
        loop {
            let (notify, deadline) = {
                let shard = self.shard(frame_id).lock().unwrap_or_else(PoisonError::into_inner);
                let entry = shard.entries.get(&frame_id)?;
                (Arc::clone(&entry.notify), entry.deadline(&self.config))
            };

            match self.try_fuse(frame_id) {
                FuseStatus::Ready(result) => return Some(result),
                FuseStatus::Unknown => return None,
                FuseStatus::Pending => {}
            }

            // Either a new arrival or the deadline; re-check in both cases.
            let _ = tokio::time::timeout_at(deadline, notify.notified()).await;
        }
    }

    /// Drop entries well past their deadline that nobody collected.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let grace = self.config.join_timeout;
        let mut removed = 0;
        for shard in &self.shards {
            let mut state = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = state.entries.len();
            state
                .entries
                .retain(|_, entry| now < entry.deadline(&self.config) + grace);
            removed += before - state.entries.len();
        }
        if removed > 0 {
            self.abandoned.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept abandoned fusion entries");
        }
        removed
    }

    /// Number of frames waiting for fusion.
    pub fn pending(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).entries.len())
            .sum()
    }

    pub fn stats(&self) -> SyncCacheStats {
        SyncCacheStats {
            fused_complete: self.fused_complete.load(Ordering::Relaxed),
            fused_timeout: self.fused_timeout.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &SyncCacheConfig {
        &self.config
    }
}

impl Default for SynchronizedCache {
    fn default() -> Self {
        Self::new(SyncCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwatch_models::{FailureKind, StageOutput};

    fn pose() -> StageOutcome {
        StageOutcome::Completed(StageOutput::Pose(vec![]))
    }

    fn compliance() -> StageOutcome {
        StageOutcome::Completed(StageOutput::ComplianceObject(vec![]))
    }

    #[test]
    fn test_fuses_when_all_required_arrive_in_any_order() {
        let cache = SynchronizedCache::default();
        let now = Instant::now();
        cache.expect(1, &[Stage::ComplianceObject, Stage::Pose]);

        assert!(cache.put(1, pose(), now));
        assert!(matches!(cache.try_fuse_at(1, now), FuseStatus::Pending));
        assert!(cache.put(1, compliance(), now));

        match cache.try_fuse_at(1, now) {
            FuseStatus::Ready(result) => {
                assert!(result.missing.is_empty());
                assert!(!result.timed_out);
                assert_eq!(result.parts.len(), 2);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_reports_missing_stages() {
        let cache = SynchronizedCache::default();
        let start = Instant::now();
        cache.expect(2, &[Stage::ComplianceObject, Stage::Pose]);
        cache.put(2, compliance(), start);

        let before = start + Duration::from_millis(149);
        assert!(matches!(cache.try_fuse_at(2, before), FuseStatus::Pending));

        let at = start + Duration::from_millis(150);
        match cache.try_fuse_at(2, at) {
            FuseStatus::Ready(result) => {
                assert!(result.timed_out);
                assert_eq!(result.missing, vec![Stage::Pose]);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(cache.stats().fused_timeout, 1);
    }

    #[test]
    fn test_exactly_once_and_late_drop() {
        let cache = SynchronizedCache::default();
        let now = Instant::now();
        cache.expect(3, &[Stage::Pose]);
        cache.put(3, pose(), now);

        assert!(matches!(cache.try_fuse_at(3, now), FuseStatus::Ready(_)));
        assert!(matches!(cache.try_fuse_at(3, now), FuseStatus::Unknown));
        assert!(!cache.put(
            3,
            StageOutcome::failed(Stage::ComplianceObject, FailureKind::Timeout, "late"),
            now
        ));
        assert_eq!(cache.pending(), 0);
        assert_eq!(cache.stats().late_dropped, 1);
    }

    #[test]
    fn test_duplicate_stage_ignored() {
        let cache = SynchronizedCache::default();
        let now = Instant::now();
        cache.expect(4, &[Stage::ComplianceObject, Stage::Pose]);
        assert!(cache.put(4, pose(), now));
        assert!(!cache.put(4, pose(), now));
    }

    #[test]
    fn test_fused_log_is_bounded() {
        let cache = SynchronizedCache::new(SyncCacheConfig {
            shards: 1,
            fused_history: 2,
            ..Default::default()
        });
        let now = Instant::now();
        for id in 1..=3 {
            cache.expect(id, &[Stage::Pose]);
            cache.put(id, pose(), now);
            assert!(matches!(cache.try_fuse_at(id, now), FuseStatus::Ready(_)));
        }
        // frame 1 fell out of the log: expect() is accepted again,
        // frame 3 is still remembered and refused
        cache.expect(3, &[Stage::Pose]);
        cache.expect(1, &[Stage::Pose]);
        assert_eq!(cache.pending(), 1);
    }

    #[test]
    fn test_put_for_unregistered_frame_dropped() {
        let cache = SynchronizedCache::new(SyncCacheConfig {
            shards: 1,
            fused_history: 1,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(!cache.put(20, pose(), now));

        for id in [21, 22] {
            cache.expect(id, &[Stage::Pose]);
            cache.put(id, pose(), now);
            assert!(matches!(cache.try_fuse_at(id, now), FuseStatus::Ready(_)));
        }
        // 21 is no longer in the delivered log but still never recreated
        assert!(!cache.put(21, compliance(), now));
        assert_eq!(cache.pending(), 0);
        assert_eq!(cache.stats().late_dropped, 2);
    }

    #[test]
    fn test_concurrent_puts_on_distinct_frames() {
        let cache = Arc::new(SynchronizedCache::default());
        let frames: Vec<FrameId> = (1..=64).collect();
        for &id in &frames {
            cache.expect(id, &[Stage::ComplianceObject, Stage::Pose]);
        }

        let now = Instant::now();
        let workers: Vec<_> = frames
            .chunks(16)
            .map(|chunk| {
                let cache = Arc::clone(&cache);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        assert!(cache.put(id, compliance(), now));
                        assert!(cache.put(id, pose(), now));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        for &id in &frames {
            assert!(matches!(
                cache.try_fuse_at(id, now),
                FuseStatus::Ready(r) if r.missing.is_empty()
            ));
        }
        assert_eq!(cache.stats().fused_complete, 64);
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn test_sweep_removes_abandoned_entries() {
        let cache = SynchronizedCache::default();
        let now = Instant::now();
        cache.expect(5, &[Stage::ComplianceObject, Stage::Pose]);
        cache.put(5, pose(), now);
        assert_eq!(cache.sweep_expired(now), 0);
        assert_eq!(cache.sweep_expired(now + Duration::from_millis(400)), 1);
        assert_eq!(cache.stats().abandoned, 1);
    }

    #[tokio::test]
    async fn test_wait_fused_wakes_on_arrival() {
        let cache = Arc::new(SynchronizedCache::default());
        cache.expect(10, &[Stage::ComplianceObject, Stage::Pose]);

        let producer = Arc::clone(&cache);
        tokio::spawn(async move {
            producer.put(10, pose(), Instant::now());
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.put(10, compliance(), Instant::now());
        });

        let result = cache.wait_fused(10).await.unwrap();
        assert!(!result.timed_out);
        assert!(cache.wait_fused(10).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_fused_bounded_by_join_timeout() {
        let cache = SynchronizedCache::default();
        cache.expect(11, &[Stage::ComplianceObject, Stage::Pose]);
        let first = Instant::now();
        cache.put(11, compliance(), first);

        let result = cache.wait_fused(11).await.unwrap();
        let waited = first.elapsed();
        assert!(result.timed_out);
        assert_eq!(result.missing, vec![Stage::Pose]);
        assert!(waited >= Duration::from_millis(150));
        assert!(waited < Duration::from_millis(500));
    }
}
