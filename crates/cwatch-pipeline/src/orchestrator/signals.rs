//! Condition evidence derived from a frame's stage outputs.

use cwatch_models::{Condition, PersonAction, PersonCompliance, StageSlot, TrackId};

use crate::config::ConfidenceThresholds;
use crate::state_manager::{ConditionSignal, Evidence};

/// Stage outputs of one frame that conditions draw evidence from.
pub(crate) struct FrameEvidence<'a> {
    pub compliance: &'a StageSlot<Vec<PersonCompliance>>,
    pub action: &'a StageSlot<Vec<PersonAction>>,
}

impl FrameEvidence<'_> {
    /// Evidence for `condition` on `track_id`.
    ///
    /// A missing object's evidence is `1 - best confidence` of that object in
    /// the person's crop. A stage that failed, did not run, or produced no
    /// entry for this track yields [`Evidence::Unavailable`].
    fn evidence(&self, track_id: TrackId, condition: &Condition) -> Evidence {
        match condition {
            Condition::MissingObject(label) => self
                .compliance
                .present()
                .and_then(|list| list.iter().find(|pc| pc.track_id == track_id))
                .map(|pc| Evidence::Observed(1.0 - pc.best_confidence(label)))
                .unwrap_or(Evidence::Unavailable),
            Condition::Action(label) => self
                .action
                .present()
                .and_then(|list| list.iter().find(|pa| pa.track_id == track_id))
                .map(|pa| Evidence::Observed(pa.confidence(label)))
                .unwrap_or(Evidence::Unavailable),
        }
    }

    pub fn signals(
        &self,
        track_id: TrackId,
        conditions: &[Condition],
        thresholds: &ConfidenceThresholds,
    ) -> Vec<ConditionSignal> {
        conditions
            .iter()
            .map(|condition| {
                let threshold = match condition {
                    Condition::MissingObject(_) => thresholds.compliance_object,
                    Condition::Action(_) => thresholds.action,
                };
                ConditionSignal::new(
                    condition.clone(),
                    self.evidence(track_id, condition),
                    threshold,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwatch_models::{
        ActionPrediction, BoundingBox, ComplianceObject, FailureKind, StageFailure,
    };

    fn compliance(confidence: f64) -> StageSlot<Vec<PersonCompliance>> {
        StageSlot::Present(vec![PersonCompliance {
            track_id: 1,
            objects: vec![ComplianceObject {
                label: "hairnet".into(),
                bbox: BoundingBox::new(0.0, 0.0, 5.0, 5.0),
                confidence,
            }],
        }])
    }

    #[test]
    fn test_missing_object_evidence() {
        let compliance = compliance(0.8);
        let action = StageSlot::NotApplicable;
        let evidence = FrameEvidence {
            compliance: &compliance,
            action: &action,
        };
        let signals = evidence.signals(
            1,
            &[Condition::MissingObject("hairnet".into())],
            &ConfidenceThresholds::default(),
        );
        match signals[0].evidence {
            Evidence::Observed(v) => assert!((v - 0.2).abs() < 1e-9),
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn test_failed_stage_is_unavailable() {
        let compliance = StageSlot::Failed(StageFailure::new(FailureKind::Timeout, "slow"));
        let action = StageSlot::Present(vec![PersonAction {
            track_id: 1,
            predictions: vec![ActionPrediction {
                label: "hand_washing".into(),
                confidence: 0.9,
            }],
        }]);
        let evidence = FrameEvidence {
            compliance: &compliance,
            action: &action,
        };
        let signals = evidence.signals(
            1,
            &[
                Condition::MissingObject("hairnet".into()),
                Condition::Action("hand_washing".into()),
            ],
            &ConfidenceThresholds::default(),
        );
        assert_eq!(signals[0].evidence, Evidence::Unavailable);
        assert_eq!(signals[1].evidence, Evidence::Observed(0.9));
        assert!((signals[1].threshold - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_untracked_person_is_unavailable() {
        let compliance = compliance(0.1);
        let action = StageSlot::NotComputed;
        let evidence = FrameEvidence {
            compliance: &compliance,
            action: &action,
        };
        let signals = evidence.signals(
            2,
            &[Condition::MissingObject("hairnet".into())],
            &ConfidenceThresholds::default(),
        );
        assert_eq!(signals[0].evidence, Evidence::Unavailable);
    }
}
