use std::collections::BTreeMap;
use std::time::Duration;

use super::{AlertContent, AlertPolicy, Decision, DecisionRule, Fired, Metric, Outcome};
use crate::detect::{Detection, Keypoint, LEFT_HIP, LEFT_SHOULDER, PERSON_LABEL};

pub const FALL_ALERT_LABEL: &str = "fall_detected";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FallRuleConfig {
    /// Minimum confidence for each of the shoulder and hip keypoints.
    pub min_keypoint_confidence: f32,
    /// Fire below this angle (degrees).
    pub angle_low: f64,
    /// Fire above this angle (degrees).
    pub angle_high: f64,
}

impl Default for FallRuleConfig {
    fn default() -> Self {
        Self {
            min_keypoint_confidence: 0.5,
            angle_low: 40.0,
            angle_high: 140.0,
        }
    }
}

/// Angle in degrees (0..=180) of the shoulder -> hip vector against the
/// horizontal. `None` when either keypoint is missing or below
/// `min_confidence`.
pub fn compute_angle(keypoints: &[Keypoint], min_confidence: f32) -> Option<f64> {
    let shoulder = keypoints.get(LEFT_SHOULDER)?;
    let hip = keypoints.get(LEFT_HIP)?;
    if shoulder.confidence < min_confidence || hip.confidence < min_confidence {
        return None;
    }
    let dx = (hip.x - shoulder.x) as f64;
    let dy = (hip.y - shoulder.y) as f64;
    Some(dy.atan2(dx).to_degrees().abs())
}

/// Near-horizontal torso: outside `[low, high]`.
pub fn is_fall_angle(angle: f64, low: f64, high: f64) -> bool {
    angle < low || angle > high
}

/// Flags people whose torso is close to horizontal.
///
/// No dedup window: every sampled frame is judged on its own. Alerts are
/// emitted per frame, so several people falling in one frame share a single
/// alert that lists each subject's angle.
#[derive(Clone, Debug, Default)]
pub struct FallAngleRule {
    config: FallRuleConfig,
}

impl FallAngleRule {
    pub fn new(config: FallRuleConfig) -> Self {
        Self { config }
    }
}

impl DecisionRule for FallAngleRule {
    fn name(&self) -> &'static str {
        "fall_angle"
    }

    fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy::PerFrame
    }

    fn evaluate(&mut self, detection: &Detection, _now: Duration) -> Decision {
        if detection.label != PERSON_LABEL {
            return Decision::new(Outcome::Skipped, None);
        }
        let Some(angle) = compute_angle(&detection.keypoints, self.config.min_keypoint_confidence)
        else {
            return Decision::new(Outcome::Indeterminate, None);
        };
        let outcome = if is_fall_angle(angle, self.config.angle_low, self.config.angle_high) {
            Outcome::Fired
        } else {
            Outcome::NotFired
        };
        Decision::new(outcome, Some(Metric::Angle(angle)))
    }

    fn describe(&self, frame_index: u64, fired: &[Fired<'_>]) -> AlertContent {
        let angles: BTreeMap<String, f64> = fired
            .iter()
            .filter_map(|f| {
                f.decision
                    .angle()
                    .map(|angle| (f.subject.to_string(), round2(angle)))
            })
            .collect();
        let angle_json = serde_json::to_string(&angles).unwrap_or_else(|_| "{}".to_string());
        AlertContent {
            label: FALL_ALERT_LABEL.to_string(),
            confidence: 1.0,
            key: format!("frame{:04}", frame_index),
            fields: vec![
                ("frame_number".to_string(), frame_index.to_string()),
                ("angle".to_string(), angle_json),
            ],
        }
    }

    /// The shoulder and hip the angle was measured between.
    fn markers(&self, fired: &Fired<'_>) -> Vec<(f32, f32)> {
        [LEFT_SHOULDER, LEFT_HIP]
            .iter()
            .filter_map(|&index| fired.detection.keypoints.get(index))
            .map(|kp| (kp.x, kp.y))
            .collect()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::COCO_KEYPOINT_COUNT;

    /// Person whose shoulder -> hip vector makes `angle_deg` with the horizontal.
    fn person_at(angle_deg: f64, shoulder_conf: f32, hip_conf: f32) -> Detection {
        let mut keypoints = vec![Keypoint::new(0.0, 0.0, 0.9); COCO_KEYPOINT_COUNT];
        let rad = angle_deg.to_radians();
        keypoints[LEFT_SHOULDER] = Keypoint::new(100.0, 100.0, shoulder_conf);
        keypoints[LEFT_HIP] = Keypoint::new(
            (100.0 + 80.0 * rad.cos()) as f32,
            (100.0 + 80.0 * rad.sin()) as f32,
            hip_conf,
        );
        Detection::person(0.9, keypoints)
    }

    #[test]
    fn angle_of_upright_and_lying_torsos() {
        let upright = person_at(90.0, 0.9, 0.9);
        let lying = person_at(0.0, 0.9, 0.9);
        assert!((compute_angle(&upright.keypoints, 0.5).unwrap() - 90.0).abs() < 0.01);
        assert!(compute_angle(&lying.keypoints, 0.5).unwrap().abs() < 0.01);
    }

    #[test]
    fn angle_is_absolute_for_upward_vectors() {
        let flipped = person_at(-160.0, 0.9, 0.9);
        assert!((compute_angle(&flipped.keypoints, 0.5).unwrap() - 160.0).abs() < 0.01);
    }

    #[test]
    fn low_confidence_keypoint_yields_none_regardless_of_geometry() {
        for angle in [0.0, 20.0, 90.0, 170.0] {
            assert!(compute_angle(&person_at(angle, 0.49, 0.9).keypoints, 0.5).is_none());
            assert!(compute_angle(&person_at(angle, 0.9, 0.3).keypoints, 0.5).is_none());
            assert!(compute_angle(&person_at(angle, 0.1, 0.1).keypoints, 0.5).is_none());
        }
        assert!(compute_angle(&person_at(20.0, 0.5, 0.5).keypoints, 0.5).is_some());
    }

    #[test]
    fn missing_keypoints_yield_none() {
        let few = vec![Keypoint::new(0.0, 0.0, 1.0); 6];
        assert!(compute_angle(&few, 0.5).is_none());
    }

    #[test]
    fn threshold_boundaries() {
        for angle in [40.0, 41.0, 90.0, 139.0, 140.0] {
            assert!(!is_fall_angle(angle, 40.0, 140.0), "{} should not fire", angle);
        }
        for angle in [0.0, 20.0, 39.99, 140.01, 179.0, 180.0] {
            assert!(is_fall_angle(angle, 40.0, 140.0), "{} should fire", angle);
        }
    }

    #[test]
    fn rule_outcomes() {
        let mut rule = FallAngleRule::default();
        let now = Duration::ZERO;
        assert_eq!(rule.evaluate(&person_at(20.0, 0.9, 0.9), now).outcome, Outcome::Fired);
        assert_eq!(rule.evaluate(&person_at(160.0, 0.9, 0.9), now).outcome, Outcome::Fired);
        assert_eq!(rule.evaluate(&person_at(85.0, 0.9, 0.9), now).outcome, Outcome::NotFired);
        assert_eq!(
            rule.evaluate(&person_at(20.0, 0.2, 0.9), now).outcome,
            Outcome::Indeterminate
        );
        let mut dog = person_at(20.0, 0.9, 0.9);
        dog.label = "dog".to_string();
        assert_eq!(rule.evaluate(&dog, now).outcome, Outcome::Skipped);
    }

    #[test]
    fn every_frame_is_judged_independently() {
        let mut rule = FallAngleRule::default();
        let fallen = person_at(10.0, 0.9, 0.9);
        for second in 0..5 {
            assert!(rule.evaluate(&fallen, Duration::from_secs(second)).fired());
        }
    }

    #[test]
    fn markers_are_shoulder_then_hip() {
        let mut rule = FallAngleRule::default();
        let fallen = person_at(0.0, 0.9, 0.9);
        let decision = rule.evaluate(&fallen, Duration::ZERO);
        let fired = Fired { subject: 0, detection: &fallen, decision: &decision };
        assert_eq!(rule.markers(&fired), vec![(100.0, 100.0), (180.0, 100.0)]);
    }

    #[test]
    fn describe_lists_every_fired_subject() {
        let mut rule = FallAngleRule::default();
        let a = person_at(20.0, 0.9, 0.9);
        let b = person_at(170.0, 0.9, 0.9);
        let da = rule.evaluate(&a, Duration::ZERO);
        let db = rule.evaluate(&b, Duration::ZERO);
        let content = rule.describe(
            12,
            &[
                Fired { subject: 0, detection: &a, decision: &da },
                Fired { subject: 2, detection: &b, decision: &db },
            ],
        );
        assert_eq!(content.label, "fall_detected");
        assert_eq!(content.confidence, 1.0);
        assert_eq!(content.key, "frame0012");
        assert_eq!(content.fields[0], ("frame_number".to_string(), "12".to_string()));
        let angles: BTreeMap<String, f64> = serde_json::from_str(&content.fields[1].1).unwrap();
        assert!((angles["0"] - 20.0).abs() < 0.01);
        assert!((angles["2"] - 170.0).abs() < 0.01);
    }
}
