//! Duplicate-frame cache keyed by a coarse frame fingerprint.
//!
//! The fingerprint is a similarity hash over a quantized pixel sample, not a
//! cryptographic digest. Two visually identical frames map to the same key;
//! rare collisions between different frames are tolerated because a hit only
//! replays detection results for a short TTL.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use cwatch_models::StageResults;
use tracing::debug;

use crate::frame::FrameHandle;
use crate::metrics;

/// Side length of the sample grid.
const SAMPLE_GRID: u32 = 16;

/// Bits dropped from each channel before hashing.
const QUANT_SHIFT: u8 = 3;

/// Coarse frame signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub width: u32,
    pub height: u32,
    pub signature: u64,
}

impl Fingerprint {
    /// Hash a quantized `16x16` RGB sample of the frame.
    pub fn compute(frame: &FrameHandle) -> Self {
        let image = frame.image();
        let (width, height) = image.dimensions();
        let mut hasher = DefaultHasher::new();

        if width > 0 && height > 0 {
            for gy in 0..SAMPLE_GRID {
                let y = (gy * height / SAMPLE_GRID).min(height - 1);
                for gx in 0..SAMPLE_GRID {
                    let x = (gx * width / SAMPLE_GRID).min(width - 1);
                    let pixel = image.get_pixel(x, y);
                    (pixel[0] >> QUANT_SHIFT).hash(&mut hasher);
                    (pixel[1] >> QUANT_SHIFT).hash(&mut hasher);
                    (pixel[2] >> QUANT_SHIFT).hash(&mut hasher);
                }
            }
        }

        Self {
            width,
            height,
            signature: hasher.finish(),
        }
    }
}

/// Cached detection results for one fingerprint.
#[derive(Debug, Clone)]
pub struct DetectionCacheEntry {
    pub fingerprint: Fingerprint,
    pub result: StageResults,
    pub created_at: Instant,
    /// Insertion order, used for capacity eviction
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct DetectionCacheConfig {
    /// Entry lifetime (default: 2s)
    pub ttl: Duration,
    /// Maximum live entries across all cameras
    pub max_entries: usize,
    pub shards: usize,
}

impl Default for DetectionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2),
            max_entries: 1024,
            shards: 8,
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

type CacheKey = (String, Fingerprint);
type Shard = RwLock<HashMap<CacheKey, DetectionCacheEntry>>;

/// Per-camera fingerprint cache, injected into the pipeline context.
pub struct DetectionCache {
    config: DetectionCacheConfig,
    shards: Vec<Shard>,
    hits: AtomicU64,
    misses: AtomicU64,
    next_seq: AtomicU64,
}

impl DetectionCache {
    pub fn new(config: DetectionCacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Shard {
        &self.shards[(fingerprint.signature % self.shards.len() as u64) as usize]
    }

    /// Return the live entry for this camera and fingerprint, if any.
    pub fn lookup(
        &self,
        camera_id: &str,
        fingerprint: &Fingerprint,
    ) -> Option<DetectionCacheEntry> {
        let now = Instant::now();
        let key = (camera_id.to_string(), *fingerprint);
        let found = {
            let shard = self
                .shard(fingerprint)
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            shard
                .get(&key)
                .filter(|entry| now.saturating_duration_since(entry.created_at) < self.config.ttl)
                .cloned()
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(found.is_some());
        found
    }

    /// Store results, replacing any previous entry for the same key.
    pub fn insert(&self, camera_id: &str, fingerprint: Fingerprint, result: StageResults) {
        if self.len() >= self.config.max_entries {
            self.sweep_expired(Instant::now());
            if self.len() >= self.config.max_entries {
                self.evict_oldest();
            }
        }

        let entry = DetectionCacheEntry {
            fingerprint,
            result,
            created_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.shard(&fingerprint)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((camera_id.to_string(), fingerprint), entry);
        debug!(camera_id, signature = fingerprint.signature, "Detection results cached");
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        self.shards
            .iter()
            .map(|shard| {
                let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
                let before = map.len();
                map.retain(|_, entry| now.saturating_duration_since(entry.created_at) < ttl);
                before - map.len()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(idx, shard)| {
                let map = shard.read().unwrap_or_else(PoisonError::into_inner);
                map.iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(key, entry)| (entry.seq, idx, key.clone()))
            })
            .min_by_key(|(seq, _, _)| *seq);

        if let Some((_, idx, key)) = oldest {
            self.shards[idx]
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }
}

impl Default for DetectionCache {
    fn default() -> Self {
        Self::new(DetectionCacheConfig::default())
    }
}
