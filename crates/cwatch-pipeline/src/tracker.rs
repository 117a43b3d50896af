//! IoU-based tracker assigning stable identities to person detections.
//!
//! Uses greedy matching by Intersection over Union between the current
//! detections and the last known box of every live track.

use std::collections::BTreeMap;

use cwatch_models::{BoundingBox, PersonDetection, TrackId, TrackedPerson};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue a track
    pub iou_threshold: f64,
    /// Frames a track survives without a matching detection
    pub max_gap: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_gap: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackSlot {
    /// Last known bounding box
    bbox: BoundingBox,
    /// Frames since last detection
    age: u32,
}

/// Greedy IoU tracker. One instance per camera stream.
pub struct IoUTracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, TrackSlot>,
    next_track_id: TrackId,
}

impl IoUTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_track_id: 1,
        }
    }

    /// Assign track ids to `detections`. Output order follows input order.
    pub fn update(&mut self, detections: &[PersonDetection]) -> Vec<TrackedPerson> {
        let mut unmatched_tracks: Vec<TrackId> = self.tracks.keys().copied().collect();
        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];

        // Highest-IoU pairs first so a crowded frame does not steal tracks
        // in detection order.
        let mut candidates: Vec<(f64, usize, TrackId)> = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for (&track_id, track) in &self.tracks {
                let iou = det.bbox.iou(&track.bbox);
                if iou > self.config.iou_threshold {
                    candidates.push((iou, det_idx, track_id));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, det_idx, track_id) in candidates {
            if assigned[det_idx].is_some() || !unmatched_tracks.contains(&track_id) {
                continue;
            }
            assigned[det_idx] = Some(track_id);
            unmatched_tracks.retain(|&id| id != track_id);
        }

        let tracked: Vec<TrackedPerson> = detections
            .iter()
            .zip(assigned)
            .map(|(det, slot)| {
                let track_id = slot.unwrap_or_else(|| self.allocate_id());
                self.tracks.insert(
                    track_id,
                    TrackSlot {
                        bbox: det.bbox,
                        age: 0,
                    },
                );
                TrackedPerson {
                    track_id,
                    bbox: det.bbox,
                    confidence: det.confidence,
                }
            })
            .collect();

        // Age unmatched tracks
        let max_gap = self.config.max_gap;
        for track_id in unmatched_tracks {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.age += 1;
            }
        }
        self.tracks.retain(|_, track| track.age <= max_gap);

        tracked
    }

    /// Next free id. Ids wrap around after `TrackId::MAX`, skipping 0 and
    /// ids still held by live tracks.
    fn allocate_id(&mut self) -> TrackId {
        loop {
            let id = self.next_track_id;
            self.next_track_id = self.next_track_id.wrapping_add(1).max(1);
            if !self.tracks.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    /// Number of live tracks, including ones inside their gap window.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for IoUTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f64, y: f64) -> PersonDetection {
        PersonDetection::new(BoundingBox::new(x, y, 50.0, 100.0), 0.9)
    }

    #[test]
    fn test_new_detections_get_fresh_ids() {
        let mut tracker = IoUTracker::default();
        let tracked = tracker.update(&[det(100.0, 100.0), det(300.0, 100.0)]);
        assert_eq!(tracked[0].track_id, 1);
        assert_eq!(tracked[1].track_id, 2);
    }

    #[test]
    fn test_identity_kept_across_frames() {
        let mut tracker = IoUTracker::default();
        tracker.update(&[det(100.0, 100.0), det(300.0, 100.0)]);
        // reversed order, slightly moved
        let tracked = tracker.update(&[det(305.0, 102.0), det(104.0, 98.0)]);
        assert_eq!(tracked[0].track_id, 2);
        assert_eq!(tracked[1].track_id, 1);
    }

    #[test]
    fn test_gap_handling() {
        let mut tracker = IoUTracker::new(TrackerConfig {
            iou_threshold: 0.3,
            max_gap: 2,
        });
        tracker.update(&[det(100.0, 100.0)]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.track_count(), 1);

        tracker.update(&[]);
        assert_eq!(tracker.track_count(), 0);

        // ids are never reused
        let tracked = tracker.update(&[det(100.0, 100.0)]);
        assert_eq!(tracked[0].track_id, 2);
    }

    #[test]
    fn test_track_ids_wrap_without_collision() {
        let mut tracker = IoUTracker::default();
        tracker.next_track_id = TrackId::MAX;
        let first = tracker.update(&[det(0.0, 0.0)]);
        assert_eq!(first[0].track_id, TrackId::MAX);

        // Keep the first track alive while two new ones appear.
        let next = tracker.update(&[det(0.0, 0.0), det(300.0, 0.0), det(600.0, 0.0)]);
        let ids: Vec<TrackId> = next.iter().map(|p| p.track_id).collect();
        assert_eq!(ids, vec![TrackId::MAX, 1, 2]);

        // Live ids are skipped when the counter points at them.
        tracker.next_track_id = 1;
        let crowded = [det(0.0, 0.0), det(300.0, 0.0), det(600.0, 0.0), det(900.0, 0.0)];
        let tracked = tracker.update(&crowded);
        assert_eq!(tracked[3].track_id, 3);
    }
}
