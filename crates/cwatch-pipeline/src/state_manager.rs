//! Per-track stability state machines.
//!
//! Each (track, condition) pair runs its own machine:
//!
//! ```text
//! Unconfirmed --qualifying--> Candidate --N consecutive--> Confirmed
//!      ^                          |                            |
//!      +------disqualifying-------+          N disqualifying    v
//!                                                            Ended
//! ```
//!
//! - A single disqualifying observation in `Candidate` resets to
//!   `Unconfirmed` with no partial credit.
//! - `Confirmed` emits one event; `Ended` emits one event carrying the last
//!   qualifying frame. `Ended` is terminal for that instance: the next
//!   observation starts a fresh one from `Unconfirmed`.
//! - [`Evidence::Unavailable`] (failed or suppressed stage) leaves the
//!   machine untouched; a lost track counts as disqualifying.

use std::collections::{BTreeMap, HashMap, VecDeque};

use cwatch_models::{
    BoundingBox, ComplianceEvent, ComplianceObject, Condition, FrameId, Keypoint, TrackId,
};
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Consecutive observations required for Confirmed and Ended (default: 3)
    pub stability_frames: u32,
    /// Observations kept per track
    pub history_len: usize,
    /// Frames without an observation before an idle track is dropped
    pub prune_after_frames: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            stability_frames: 3,
            history_len: 16,
            prune_after_frames: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityState {
    Unconfirmed,
    Candidate,
    Confirmed,
    Ended,
}

/// Evidence for one condition in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evidence {
    /// Condition confidence from a stage output
    Observed(f64),
    /// Track was not detected in this frame
    TrackLost,
    /// The stage that would provide evidence failed or did not run
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSignal {
    pub condition: Condition,
    pub evidence: Evidence,
    /// Qualifying cutoff for `Observed` confidence
    pub threshold: f64,
}

impl ConditionSignal {
    pub fn new(condition: Condition, evidence: Evidence, threshold: f64) -> Self {
        Self {
            condition,
            evidence,
            threshold,
        }
    }

    /// `Some(true)` for qualifying, `Some(false)` for disqualifying, `None`
    /// when there is no evidence.
    fn qualifies(&self) -> Option<bool> {
        match self.evidence {
            Evidence::Observed(confidence) => Some(confidence >= self.threshold),
            Evidence::TrackLost => Some(false),
            Evidence::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Confirmed { start: FrameId },
    Ended { start: FrameId, end: FrameId },
}

#[derive(Debug, Clone)]
struct StabilityMachine {
    state: StabilityState,
    streak: u32,
    misses: u32,
    start_frame: FrameId,
    last_qualifying: FrameId,
}

impl StabilityMachine {
    fn new() -> Self {
        Self {
            state: StabilityState::Unconfirmed,
            streak: 0,
            misses: 0,
            start_frame: 0,
            last_qualifying: 0,
        }
    }

    fn step(&mut self, frame_id: FrameId, qualifying: bool, required: u32) -> Option<Transition> {
        if self.state == StabilityState::Ended {
            *self = Self::new();
        }

        match (self.state, qualifying) {
            (StabilityState::Unconfirmed, true) => {
                self.state = StabilityState::Candidate;
                self.streak = 1;
                self.start_frame = frame_id;
                self.last_qualifying = frame_id;
                self.try_confirm(required)
            }
            (StabilityState::Unconfirmed, false) => None,
            (StabilityState::Candidate, true) => {
                self.streak += 1;
                self.last_qualifying = frame_id;
                self.try_confirm(required)
            }
            (StabilityState::Candidate, false) => {
                self.state = StabilityState::Unconfirmed;
                self.streak = 0;
                None
            }
            (StabilityState::Confirmed, true) => {
                self.misses = 0;
                self.last_qualifying = frame_id;
                None
            }
            (StabilityState::Confirmed, false) => {
                self.misses += 1;
                if self.misses >= required {
                    self.state = StabilityState::Ended;
                    Some(Transition::Ended {
                        start: self.start_frame,
                        end: self.last_qualifying,
                    })
                } else {
                    None
                }
            }
            (StabilityState::Ended, _) => None,
        }
    }

    fn try_confirm(&mut self, required: u32) -> Option<Transition> {
        if self.streak >= required.max(1) {
            self.state = StabilityState::Confirmed;
            self.misses = 0;
            Some(Transition::Confirmed {
                start: self.start_frame,
            })
        } else {
            None
        }
    }
}

/// What was seen of a track in one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackObservation {
    pub frame_id: FrameId,
    pub bbox: Option<BoundingBox>,
    pub keypoints: Option<Vec<Keypoint>>,
    pub compliance_objects: Option<Vec<ComplianceObject>>,
}

/// Per-frame input for one present track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackUpdate {
    pub track_id: TrackId,
    pub observation: TrackObservation,
    pub signals: Vec<ConditionSignal>,
}

/// A temporally linked person and its condition machines.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: TrackId,
    history: VecDeque<TrackObservation>,
    machines: BTreeMap<Condition, StabilityMachine>,
    last_frame_id: Option<FrameId>,
    last_seen_tick: u64,
}

impl Track {
    fn new(track_id: TrackId, tick: u64) -> Self {
        Self {
            track_id,
            history: VecDeque::new(),
            machines: BTreeMap::new(),
            last_frame_id: None,
            last_seen_tick: tick,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &TrackObservation> {
        self.history.iter()
    }

    pub fn last_frame_id(&self) -> Option<FrameId> {
        self.last_frame_id
    }

    pub fn state(&self, condition: &Condition) -> StabilityState {
        self.machines
            .get(condition)
            .map(|m| m.state)
            .unwrap_or(StabilityState::Unconfirmed)
    }

    /// Conditions currently in `Confirmed`.
    pub fn confirmed_conditions(&self) -> Vec<&Condition> {
        self.machines
            .iter()
            .filter(|(_, m)| m.state == StabilityState::Confirmed)
            .map(|(c, _)| c)
            .collect()
    }
}

/// Owns all tracks of one camera stream.
pub struct StateManager {
    camera_id: String,
    config: StabilityConfig,
    tracks: HashMap<TrackId, Track>,
    last_frame_id: Option<FrameId>,
    tick: u64,
}

impl StateManager {
    pub fn new(camera_id: impl Into<String>, config: StabilityConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            tracks: HashMap::new(),
            last_frame_id: None,
            tick: 0,
        }
    }

    /// Apply one condition signal for a track.
    ///
    /// Observations older than the track's latest frame are rejected.
    pub fn observe(
        &mut self,
        track_id: TrackId,
        frame_id: FrameId,
        signal: &ConditionSignal,
    ) -> Option<ComplianceEvent> {
        let tick = self.tick;
        let track = self
            .tracks
            .entry(track_id)
            .or_insert_with(|| Track::new(track_id, tick));

        if track.last_frame_id.is_some_and(|last| frame_id < last) {
            warn!(
                camera_id = %self.camera_id,
                track_id,
                frame_id,
                last_frame_id = track.last_frame_id,
                "Out-of-order observation rejected"
            );
            return None;
        }
        track.last_frame_id = Some(frame_id);

        let qualifying = signal.qualifies()?;
        let machine = track
            .machines
            .entry(signal.condition.clone())
            .or_insert_with(StabilityMachine::new);

        let transition = machine.step(frame_id, qualifying, self.config.stability_frames)?;
        let event = match transition {
            Transition::Confirmed { start } => ComplianceEvent::confirmed(
                self.camera_id.clone(),
                track_id,
                signal.condition.clone(),
                start,
            ),
            Transition::Ended { start, end } => ComplianceEvent::ended(
                self.camera_id.clone(),
                track_id,
                signal.condition.clone(),
                start,
                end,
            ),
        };

        info!(
            camera_id = %self.camera_id,
            track_id,
            condition = %event.condition,
            event_type = event.event_type.as_str(),
            start_frame_id = event.start_frame_id,
            end_frame_id = ?event.end_frame_id,
            "Compliance event"
        );
        metrics::record_event(event.event_type);
        Some(event)
    }

    /// Apply one processed frame.
    ///
    /// Tracks with an update get their signals applied; every other known
    /// track is treated as lost for all its conditions. Idle tracks are
    /// pruned afterwards.
    pub fn update_frame(
        &mut self,
        frame_id: FrameId,
        updates: Vec<TrackUpdate>,
    ) -> Vec<ComplianceEvent> {
        if self.last_frame_id.is_some_and(|last| frame_id < last) {
            warn!(
                camera_id = %self.camera_id,
                frame_id,
                last_frame_id = self.last_frame_id,
                "Out-of-order frame rejected"
            );
            return Vec::new();
        }
        self.last_frame_id = Some(frame_id);
        self.tick += 1;

        let mut events = Vec::new();
        let mut present = Vec::with_capacity(updates.len());

        for update in updates {
            present.push(update.track_id);
            let tick = self.tick;
            let history_len = self.config.history_len;
            let track = self
                .tracks
                .entry(update.track_id)
                .or_insert_with(|| Track::new(update.track_id, tick));
            track.last_seen_tick = tick;
            track.history.push_back(update.observation);
            while track.history.len() > history_len {
                track.history.pop_front();
            }

            for signal in &update.signals {
                events.extend(self.observe(update.track_id, frame_id, signal));
            }
        }

        let lost: Vec<(TrackId, Vec<Condition>)> = self
            .tracks
            .values()
            .filter(|t| !present.contains(&t.track_id))
            .map(|t| (t.track_id, t.machines.keys().cloned().collect()))
            .collect();
        for (track_id, conditions) in lost {
            for condition in conditions {
                let signal = ConditionSignal::new(condition, Evidence::TrackLost, 0.0);
                events.extend(self.observe(track_id, frame_id, &signal));
            }
        }

        self.prune();
        events
    }

    fn prune(&mut self) {
        let tick = self.tick;
        let horizon = self.config.prune_after_frames;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, track| tick.saturating_sub(track.last_seen_tick) <= horizon);
        let pruned = before - self.tracks.len();
        if pruned > 0 {
            debug!(camera_id = %self.camera_id, pruned, "Pruned idle tracks");
        }
    }

    pub fn state(&self, track_id: TrackId, condition: &Condition) -> Option<StabilityState> {
        self.tracks.get(&track_id).map(|t| t.state(condition))
    }

    pub fn track(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks
            .values()
            .map(|t| t.confirmed_conditions().len())
            .sum()
    }
}
