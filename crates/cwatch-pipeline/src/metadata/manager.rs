//! Sharded, concurrent store for in-flight frame metadata.
//!
//! Entries are keyed by `frame_id` and spread over independently locked
//! shards. Shard locks are held only to look up or insert the entry `Arc`;
//! stage writes go to per-slot `OnceLock`s, so concurrent stages never
//! contend on a global lock and a slot can only be written once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cwatch_models::{FrameId, SlotStatus, Stage, StageOutcome, StageResults};
use tracing::{debug, warn};

use super::{FrameMetadata, ProcessingTimes};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameHandle};
use crate::metrics;

/// Configuration for the metadata manager.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Entries older than this are dropped by `sweep_expired`
    pub ttl: Duration,
    /// Maximum number of live entries
    pub capacity: usize,
    /// Number of lock shards
    pub shards: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            capacity: 512,
            shards: 16,
        }
    }
}

struct FrameEntry {
    frame_id: FrameId,
    camera_id: String,
    captured_at: Instant,
    received_at: DateTime<Utc>,
    raw_frame: FrameHandle,
    from_cache: bool,
    created_at: Instant,
    slots: [OnceLock<StageOutcome>; 4],
    timings: [OnceLock<Duration>; 4],
}

impl FrameEntry {
    fn snapshot(&self) -> FrameMetadata {
        let mut stage_results = StageResults::default();
        let mut processing_times = ProcessingTimes::default();

        for stage in Stage::ALL {
            if let Some(outcome) = self.slots[stage.index()].get() {
                stage_results.set(outcome.clone());
            }
            if let Some(elapsed) = self.timings[stage.index()].get() {
                processing_times.insert(stage, *elapsed);
            }
        }

        FrameMetadata {
            frame_id: self.frame_id,
            camera_id: self.camera_id.clone(),
            captured_at: self.captured_at,
            received_at: self.received_at,
            raw_frame: self.raw_frame.clone(),
            stage_results,
            processing_times,
            from_cache: self.from_cache,
        }
    }
}

type Shard = RwLock<HashMap<FrameId, Arc<FrameEntry>>>;

/// Concurrent store and lifecycle manager for [`FrameMetadata`].
pub struct FrameMetadataManager {
    config: MetadataConfig,
    shards: Vec<Shard>,
    next_id: AtomicU64,
    len: AtomicUsize,
}

impl FrameMetadataManager {
    pub fn new(config: MetadataConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            config,
            next_id: AtomicU64::new(1),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, frame_id: FrameId) -> &Shard {
        &self.shards[(frame_id % self.shards.len() as u64) as usize]
    }

    fn lookup(&self, frame_id: FrameId) -> Option<Arc<FrameEntry>> {
        self.shard(frame_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame_id)
            .cloned()
    }

    /// Register a new frame and return its id.
    ///
    /// Ids are handed out from one counter, so they increase monotonically
    /// per camera and are unique across cameras.
    pub fn create(&self, frame: &Frame, from_cache: bool) -> FrameId {
        if self.len() >= self.config.capacity {
            self.make_room();
        }

        let frame_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(FrameEntry {
            frame_id,
            camera_id: frame.camera_id.clone(),
            captured_at: frame.captured_at,
            received_at: frame.received_at,
            raw_frame: frame.handle.clone(),
            from_cache,
            created_at: Instant::now(),
            slots: Default::default(),
            timings: Default::default(),
        });

        self.shard(frame_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(frame_id, entry);
        let live = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_live_frames(live);

        debug!(frame_id, camera_id = %frame.camera_id, from_cache, "Frame metadata created");
        frame_id
    }

    /// Write a stage's terminal outcome into the frame's slot.
    pub fn record_stage(
        &self,
        frame_id: FrameId,
        outcome: StageOutcome,
        elapsed: Option<Duration>,
    ) -> PipelineResult<()> {
        let entry = self
            .lookup(frame_id)
            .ok_or(PipelineError::UnknownFrame(frame_id))?;
        let stage = outcome.stage();

        entry.slots[stage.index()]
            .set(outcome)
            .map_err(|_| PipelineError::StageAlreadyRecorded { frame_id, stage })?;
        if let Some(elapsed) = elapsed {
            let _ = entry.timings[stage.index()].set(elapsed);
        }
        Ok(())
    }

    /// Snapshot of a live frame.
    pub fn get(&self, frame_id: FrameId) -> Option<FrameMetadata> {
        self.lookup(frame_id).map(|entry| entry.snapshot())
    }

    /// Status of one stage slot of a live frame.
    pub fn stage_status(&self, frame_id: FrameId, stage: Stage) -> Option<SlotStatus> {
        let entry = self.lookup(frame_id)?;
        let status = match entry.slots[stage.index()].get() {
            None => SlotStatus::NotComputed,
            Some(StageOutcome::Completed(_)) => SlotStatus::Present,
            Some(StageOutcome::NotApplicable(_)) => SlotStatus::NotApplicable,
            Some(StageOutcome::Failed { failure, .. }) => SlotStatus::Failed(failure.kind),
        };
        Some(status)
    }

    /// Remove a frame and hand off its final snapshot.
    ///
    /// Later `record_stage` calls for this id fail with `UnknownFrame`.
    pub fn evict(&self, frame_id: FrameId) -> Option<FrameMetadata> {
        let removed = self
            .shard(frame_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame_id)?;
        let live = self.len.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_live_frames(live);
        Some(removed.snapshot())
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            let ttl = self.config.ttl;
            map.retain(|_, entry| now.saturating_duration_since(entry.created_at) < ttl);
            removed += before - map.len();
        }

        if removed > 0 {
            let live = self.len.fetch_sub(removed, Ordering::Relaxed).saturating_sub(removed);
            metrics::set_live_frames(live);
            debug!(removed, "Swept expired frame metadata");
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    fn make_room(&self) {
        if self.sweep_expired(Instant::now()) > 0 && self.len() < self.config.capacity {
            return;
        }

        let oldest = self
            .shards
            .iter()
            .filter_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .min()
                    .copied()
            })
            .min();

        if let Some(frame_id) = oldest {
            warn!(
                frame_id,
                capacity = self.config.capacity,
                "Frame metadata store full, evicting oldest entry"
            );
            metrics::record_metadata_overflow();
            self.evict(frame_id);
        }
    }
}

impl Default for FrameMetadataManager {
    fn default() -> Self {
        Self::new(MetadataConfig::default())
    }
}
