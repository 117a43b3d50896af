//! Per-person detection payloads produced by the four model stages.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, Keypoint};
use crate::TrackId;

/// Raw output of the primary person detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersonDetection {
    pub bbox: BoundingBox,
    /// Detection confidence (0.0-1.0)
    pub confidence: f64,
    /// Model class id (person is usually 0)
    #[serde(default)]
    pub class_id: u32,
}

impl PersonDetection {
    pub fn new(bbox: BoundingBox, confidence: f64) -> Self {
        Self {
            bbox,
            confidence,
            class_id: 0,
        }
    }
}

/// Person detection with a tracker-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TrackedPerson {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

/// Compliance-relevant object (e.g. `hairnet`, `gloves`) in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComplianceObject {
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

/// Compliance objects found inside one person's crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersonCompliance {
    pub track_id: TrackId,
    pub objects: Vec<ComplianceObject>,
}

impl PersonCompliance {
    /// Highest confidence for `label`, or 0.0 when the object was not seen.
    pub fn best_confidence(&self, label: &str) -> f64 {
        self.objects
            .iter()
            .filter(|o| o.label == label)
            .map(|o| o.confidence)
            .fold(0.0, f64::max)
    }
}

/// Raw pose estimator output for one crop (crop coordinates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoseEstimate {
    pub keypoints: Vec<Keypoint>,
}

/// Pose of one tracked person in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersonPose {
    pub track_id: TrackId,
    pub keypoints: Vec<Keypoint>,
}

/// Smoothed keypoint window handed to the action classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoseSequence {
    pub track_id: TrackId,
    /// Oldest frame first
    pub frames: Vec<Vec<Keypoint>>,
}

/// One action label with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionPrediction {
    pub label: String,
    pub confidence: f64,
}

/// Action predictions for one tracked person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersonAction {
    pub track_id: TrackId,
    pub predictions: Vec<ActionPrediction>,
}

impl PersonAction {
    /// Confidence for `label`, or 0.0 when the classifier did not score it.
    pub fn confidence(&self, label: &str) -> f64 {
        self.predictions
            .iter()
            .filter(|p| p.label == label)
            .map(|p| p.confidence)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_confidence_picks_max() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let pc = PersonCompliance {
            track_id: 1,
            objects: vec![
                ComplianceObject {
                    label: "hairnet".into(),
                    bbox,
                    confidence: 0.4,
                },
                ComplianceObject {
                    label: "hairnet".into(),
                    bbox,
                    confidence: 0.8,
                },
                ComplianceObject {
                    label: "gloves".into(),
                    bbox,
                    confidence: 0.9,
                },
            ],
        };
        assert_eq!(pc.best_confidence("hairnet"), 0.8);
        assert_eq!(pc.best_confidence("mask"), 0.0);
    }
}
