//! Randomized checks of the stability state machine against a reference
//! model. Sequences are generated from fixed seeds so failures reproduce.

use cwatch_models::{Condition, EventType, FrameId};
use cwatch_pipeline::{ConditionSignal, Evidence, StabilityConfig, StabilityState, StateManager};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THRESHOLD: f64 = 0.5;
const TRACK: u32 = 7;

/// Straight-line model of the confirmation rules.
#[derive(Debug, Default)]
struct Reference {
    confirmed: bool,
    ended: bool,
    /// Consecutive qualifying observations while unconfirmed
    run: Vec<FrameId>,
    /// Consecutive disqualifying observations while confirmed
    misses: u32,
    start: FrameId,
    last_qualifying: FrameId,
}

impl Reference {
    fn apply(
        &mut self,
        frame_id: FrameId,
        qualifying: Option<bool>,
        n: u32,
    ) -> Option<(EventType, FrameId, Option<FrameId>)> {
        let qualifying = qualifying?;
        if self.ended {
            *self = Reference::default();
        }

        if !self.confirmed {
            if !qualifying {
                self.run.clear();
                return None;
            }
            self.run.push(frame_id);
            if self.run.len() as u32 >= n {
                self.confirmed = true;
                self.start = self.run[0];
                self.last_qualifying = frame_id;
                self.misses = 0;
                self.run.clear();
                return Some((EventType::Confirmed, self.start, None));
            }
            return None;
        }

        if qualifying {
            self.misses = 0;
            self.last_qualifying = frame_id;
            None
        } else {
            self.misses += 1;
            if self.misses >= n {
                self.ended = true;
                Some((EventType::Ended, self.start, Some(self.last_qualifying)))
            } else {
                None
            }
        }
    }

    fn state(&self) -> StabilityState {
        if self.ended {
            StabilityState::Ended
        } else if self.confirmed {
            StabilityState::Confirmed
        } else if self.run.is_empty() {
            StabilityState::Unconfirmed
        } else {
            StabilityState::Candidate
        }
    }
}

fn random_evidence(rng: &mut StdRng, qualify_bias: f64) -> Evidence {
    match rng.random_range(0..10) {
        0 => Evidence::Unavailable,
        1 => Evidence::TrackLost,
        _ => {
            if rng.random_bool(qualify_bias) {
                Evidence::Observed(rng.random_range(THRESHOLD..=1.0))
            } else {
                Evidence::Observed(rng.random_range(0.0..THRESHOLD))
            }
        }
    }
}

fn qualifies(evidence: &Evidence) -> Option<bool> {
    match evidence {
        Evidence::Observed(c) => Some(*c >= THRESHOLD),
        Evidence::TrackLost => Some(false),
        Evidence::Unavailable => None,
    }
}

#[test]
fn test_state_machine_matches_reference() {
    let condition = Condition::MissingObject("hairnet".into());

    for seed in 0..200u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = rng.random_range(1..=5u32);
        let qualify_bias = rng.random_range(0.3..0.95);

        let mut manager = StateManager::new(
            "cam-prop",
            StabilityConfig {
                stability_frames: n,
                ..StabilityConfig::default()
            },
        );
        let mut reference = Reference::default();

        for step in 0..120u64 {
            let frame_id = step + 1;
            let evidence = random_evidence(&mut rng, qualify_bias);
            let signal = ConditionSignal::new(condition.clone(), evidence, THRESHOLD);

            let expected = reference.apply(frame_id, qualifies(&evidence), n);
            let actual = manager
                .observe(TRACK, frame_id, &signal)
                .map(|e| (e.event_type, e.start_frame_id, e.end_frame_id));

            assert_eq!(
                actual, expected,
                "seed {seed}, n {n}, frame {frame_id}, evidence {evidence:?}"
            );
            assert_eq!(
                manager.state(TRACK, &condition),
                Some(reference.state()),
                "seed {seed}, n {n}, frame {frame_id}"
            );
        }
    }
}

#[test]
fn test_confirmation_requires_consecutive_qualifying_frames() {
    let condition = Condition::Action("hand_washing".into());

    for seed in 0..100u64 {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let n = rng.random_range(2..=6u32);
        let mut manager = StateManager::new(
            "cam-prop",
            StabilityConfig {
                stability_frames: n,
                ..StabilityConfig::default()
            },
        );

        // Qualifying frames seen since the last disqualifying one.
        let mut trailing: Vec<FrameId> = Vec::new();
        for step in 0..150u64 {
            let frame_id = step + 1;
            let evidence = random_evidence(&mut rng, 0.7);
            match qualifies(&evidence) {
                Some(true) => trailing.push(frame_id),
                Some(false) => trailing.clear(),
                None => {}
            }

            let signal = ConditionSignal::new(condition.clone(), evidence, THRESHOLD);
            if let Some(event) = manager.observe(TRACK, frame_id, &signal) {
                if event.event_type == EventType::Confirmed {
                    assert!(trailing.len() as u32 >= n, "seed {seed}: confirmed early");
                    assert_eq!(event.start_frame_id, trailing[trailing.len() - n as usize]);
                    assert!(event.start_frame_id <= frame_id);
                    trailing.clear();
                }
            }
        }
    }
}
