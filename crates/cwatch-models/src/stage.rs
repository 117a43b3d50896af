//! Detection stages and their per-frame result slots.
//!
//! Every frame carries one [`StageSlot`] per [`Stage`]. A slot starts as
//! [`StageSlot::NotComputed`] and is written at most once with a terminal
//! value: the stage output, an explicit "not applicable" marker, or a
//! failure record. Failed slots mean *absent evidence*, never a negative
//! compliance signal.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::detection::{PersonAction, PersonCompliance, PersonPose, TrackedPerson};

/// One model-backed detection step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Primary person detector
    Person,
    /// Head-covering / hygiene object detector on person crops
    ComplianceObject,
    /// Pose estimator on person crops
    Pose,
    /// Action classifier on smoothed pose sequences
    Action,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Person,
        Stage::ComplianceObject,
        Stage::Pose,
        Stage::Action,
    ];

    /// Stages that only run when the primary detector found someone.
    pub const DOWNSTREAM: [Stage; 3] = [Stage::ComplianceObject, Stage::Pose, Stage::Action];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Person => "person",
            Stage::ComplianceObject => "compliance_object",
            Stage::Pose => "pose",
            Stage::Action => "action",
        }
    }

    /// Dense index, stable across releases.
    pub fn index(&self) -> usize {
        match self {
            Stage::Person => 0,
            Stage::ComplianceObject => 1,
            Stage::Pose => 2,
            Stage::Action => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct StageParseError(pub String);

impl FromStr for Stage {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(Stage::Person),
            "compliance_object" | "compliance" => Ok(Stage::ComplianceObject),
            "pose" => Ok(Stage::Pose),
            "action" => Ok(Stage::Action),
            other => Err(StageParseError(other.to_string())),
        }
    }
}

/// Category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The model returned an error
    Error,
    /// The model call exceeded its timeout
    Timeout,
    /// The worker pool was saturated
    Rejected,
    /// The model call panicked
    Panicked,
    /// An upstream stage produced no evidence
    DependencyUnavailable,
    /// The result did not arrive before the fusion deadline
    JoinTimeout,
    /// The model returned a malformed result (e.g. wrong batch length)
    InvalidOutput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Rejected => "rejected",
            FailureKind::Panicked => "panicked",
            FailureKind::DependencyUnavailable => "dependency_unavailable",
            FailureKind::JoinTimeout => "join_timeout",
            FailureKind::InvalidOutput => "invalid_output",
        }
    }
}

/// Serializable failure record stored in a failed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Write-once result slot for one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StageSlot<T> {
    /// Stage has not produced a terminal value yet
    #[default]
    NotComputed,
    /// Stage output
    Present(T),
    /// Stage was deliberately not run (e.g. no persons in frame)
    NotApplicable,
    /// Stage failed; evidence is absent
    Failed(StageFailure),
}

/// Payload-free view of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    NotComputed,
    Present,
    NotApplicable,
    Failed(FailureKind),
}

impl<T> StageSlot<T> {
    pub fn status(&self) -> SlotStatus {
        match self {
            StageSlot::NotComputed => SlotStatus::NotComputed,
            StageSlot::Present(_) => SlotStatus::Present,
            StageSlot::NotApplicable => SlotStatus::NotApplicable,
            StageSlot::Failed(f) => SlotStatus::Failed(f.kind),
        }
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            StageSlot::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageSlot::Failed(_))
    }

    pub fn is_computed(&self) -> bool {
        !matches!(self, StageSlot::NotComputed)
    }
}

/// Fixed-shape record with one slot per stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct StageResults {
    pub person: StageSlot<Vec<TrackedPerson>>,
    pub compliance_object: StageSlot<Vec<PersonCompliance>>,
    pub pose: StageSlot<Vec<PersonPose>>,
    pub action: StageSlot<Vec<PersonAction>>,
}

impl StageResults {
    /// Status of the given stage's slot.
    pub fn status(&self, stage: Stage) -> SlotStatus {
        match stage {
            Stage::Person => self.person.status(),
            Stage::ComplianceObject => self.compliance_object.status(),
            Stage::Pose => self.pose.status(),
            Stage::Action => self.action.status(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_stages().is_empty()
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| matches!(self.status(*s), SlotStatus::Failed(_)))
            .collect()
    }

    /// Write an outcome into its slot, replacing whatever was there.
    ///
    /// Used to rebuild snapshots (e.g. from the fingerprint cache); the
    /// write-once discipline is enforced by the metadata manager, not here.
    pub fn set(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Completed(output) => match output {
                StageOutput::Person(v) => self.person = StageSlot::Present(v),
                StageOutput::ComplianceObject(v) => self.compliance_object = StageSlot::Present(v),
                StageOutput::Pose(v) => self.pose = StageSlot::Present(v),
                StageOutput::Action(v) => self.action = StageSlot::Present(v),
            },
            StageOutcome::NotApplicable(stage) => match stage {
                Stage::Person => self.person = StageSlot::NotApplicable,
                Stage::ComplianceObject => self.compliance_object = StageSlot::NotApplicable,
                Stage::Pose => self.pose = StageSlot::NotApplicable,
                Stage::Action => self.action = StageSlot::NotApplicable,
            },
            StageOutcome::Failed { stage, failure } => match stage {
                Stage::Person => self.person = StageSlot::Failed(failure),
                Stage::ComplianceObject => self.compliance_object = StageSlot::Failed(failure),
                Stage::Pose => self.pose = StageSlot::Failed(failure),
                Stage::Action => self.action = StageSlot::Failed(failure),
            },
        }
    }

    /// Terminal outcomes of all computed slots, in stage order.
    pub fn outcomes(&self) -> Vec<StageOutcome> {
        fn to_outcome<T: Clone>(
            stage: Stage,
            slot: &StageSlot<T>,
            wrap: fn(T) -> StageOutput,
        ) -> Option<StageOutcome> {
            match slot {
                StageSlot::NotComputed => None,
                StageSlot::Present(v) => Some(StageOutcome::Completed(wrap(v.clone()))),
                StageSlot::NotApplicable => Some(StageOutcome::NotApplicable(stage)),
                StageSlot::Failed(f) => Some(StageOutcome::Failed {
                    stage,
                    failure: f.clone(),
                }),
            }
        }

        [
            to_outcome(Stage::Person, &self.person, StageOutput::Person),
            to_outcome(
                Stage::ComplianceObject,
                &self.compliance_object,
                StageOutput::ComplianceObject,
            ),
            to_outcome(Stage::Pose, &self.pose, StageOutput::Pose),
            to_outcome(Stage::Action, &self.action, StageOutput::Action),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Output of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum StageOutput {
    Person(Vec<TrackedPerson>),
    ComplianceObject(Vec<PersonCompliance>),
    Pose(Vec<PersonPose>),
    Action(Vec<PersonAction>),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Person(_) => Stage::Person,
            StageOutput::ComplianceObject(_) => Stage::ComplianceObject,
            StageOutput::Pose(_) => Stage::Pose,
            StageOutput::Action(_) => Stage::Action,
        }
    }
}

/// Terminal value produced for one stage of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed(StageOutput),
    NotApplicable(Stage),
    Failed { stage: Stage, failure: StageFailure },
}

impl StageOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutcome::Completed(output) => output.stage(),
            StageOutcome::NotApplicable(stage) => *stage,
            StageOutcome::Failed { stage, .. } => *stage,
        }
    }

    pub fn failed(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        StageOutcome::Failed {
            stage,
            failure: StageFailure::new(kind, message),
        }
    }

    pub fn output(&self) -> Option<&StageOutput> {
        match self {
            StageOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StageOutcome::Failed { failure, .. } => Some(failure.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("gait".parse::<Stage>().is_err());
    }

    #[test]
    fn test_default_results_not_computed() {
        let results = StageResults::default();
        for stage in Stage::ALL {
            assert_eq!(results.status(stage), SlotStatus::NotComputed);
        }
        assert!(!results.has_failures());
        assert!(results.outcomes().is_empty());
    }

    #[test]
    fn test_set_and_failed_stages() {
        let mut results = StageResults::default();
        results.set(StageOutcome::Completed(StageOutput::Person(vec![])));
        results.set(StageOutcome::NotApplicable(Stage::Pose));
        results.set(StageOutcome::failed(
            Stage::ComplianceObject,
            FailureKind::Timeout,
            "slow",
        ));

        assert_eq!(results.status(Stage::Person), SlotStatus::Present);
        assert_eq!(results.status(Stage::Pose), SlotStatus::NotApplicable);
        assert_eq!(results.failed_stages(), vec![Stage::ComplianceObject]);
        assert_eq!(results.outcomes().len(), 3);
    }

    #[test]
    fn test_slot_serialization_is_tagged() {
        let slot: StageSlot<Vec<u32>> = StageSlot::NotApplicable;
        let json = serde_json::to_value(&slot).unwrap();
        assert_eq!(json["status"], "not_applicable");
    }
}
