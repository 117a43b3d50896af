//! Per-track exponential smoothing of pose keypoints.
//!
//! `smoothed[t] = alpha * raw[t] + (1 - alpha) * smoothed[t - 1]`, with
//! `smoothed[0] = raw[0]`. Each track keeps a bounded window of smoothed
//! frames that doubles as the action classifier's input sequence.

use std::collections::{HashMap, HashSet, VecDeque};

use cwatch_models::{Keypoint, PoseSequence, TrackId};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SmootherConfig {
    /// Weight of the newest observation (0.0-1.0, default: 0.65)
    pub alpha: f64,
    /// Smoothed frames kept per track
    pub window: usize,
    /// Mean keypoint displacement (pixels) between consecutive smoothed
    /// frames above which a track is considered jittery
    pub jitter_threshold: f64,
    /// Keypoints below this confidence are ignored by the jitter check
    pub min_keypoint_confidence: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            alpha: 0.65,
            window: 8,
            jitter_threshold: 20.0,
            min_keypoint_confidence: 0.3,
        }
    }
}

/// EMA keypoint smoother keyed by track.
pub struct TemporalSmoother {
    config: SmootherConfig,
    tracks: HashMap<TrackId, VecDeque<Vec<Keypoint>>>,
}

impl TemporalSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config: SmootherConfig {
                alpha: config.alpha.clamp(0.0, 1.0),
                window: config.window.max(2),
                ..config
            },
            tracks: HashMap::new(),
        }
    }

    /// Smooth a new observation for `track_id` and return the result.
    ///
    /// The first observation of a track (or one whose keypoint count differs
    /// from the previous frame) is returned unchanged.
    pub fn update(&mut self, track_id: TrackId, raw: &[Keypoint]) -> Vec<Keypoint> {
        let alpha = self.config.alpha;
        let window = self.config.window;
        let buffer = self.tracks.entry(track_id).or_default();

        let smoothed = match buffer.back() {
            Some(prev) if prev.len() == raw.len() => raw
                .iter()
                .zip(prev)
                .map(|(r, p)| Keypoint {
                    x: alpha * r.x + (1.0 - alpha) * p.x,
                    y: alpha * r.y + (1.0 - alpha) * p.y,
                    confidence: r.confidence,
                })
                .collect(),
            Some(prev) => {
                debug!(
                    track_id,
                    previous = prev.len(),
                    current = raw.len(),
                    "Keypoint layout changed, restarting smoothing"
                );
                buffer.clear();
                raw.to_vec()
            }
            None => raw.to_vec(),
        };

        buffer.push_back(smoothed.clone());
        while buffer.len() > window {
            buffer.pop_front();
        }
        smoothed
    }

    /// Whether the track's recent motion is below the jitter threshold.
    ///
    /// Unknown tracks are not consistent; tracks with fewer than two frames
    /// are.
    pub fn is_consistent(&self, track_id: TrackId) -> bool {
        let Some(buffer) = self.tracks.get(&track_id) else {
            return false;
        };
        let min_conf = self.config.min_keypoint_confidence;

        buffer
            .iter()
            .zip(buffer.iter().skip(1))
            .filter_map(|(a, b)| {
                let displacements: Vec<f64> = a
                    .iter()
                    .zip(b)
                    .filter(|(ka, kb)| ka.confidence >= min_conf && kb.confidence >= min_conf)
                    .map(|(ka, kb)| ka.distance(kb))
                    .collect();
                if displacements.is_empty() {
                    None
                } else {
                    Some(displacements.iter().sum::<f64>() / displacements.len() as f64)
                }
            })
            .all(|mean| mean <= self.config.jitter_threshold)
    }

    /// Smoothed window for the action classifier, oldest frame first.
    pub fn window(&self, track_id: TrackId) -> Option<PoseSequence> {
        self.tracks.get(&track_id).map(|buffer| PoseSequence {
            track_id,
            frames: buffer.iter().cloned().collect(),
        })
    }

    /// Drop buffers of tracks not in `active`.
    pub fn retain_tracks(&mut self, active: &HashSet<TrackId>) {
        self.tracks.retain(|id, _| active.contains(id));
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new(SmootherConfig::default())
    }
}
