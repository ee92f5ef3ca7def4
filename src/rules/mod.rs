//! Decision rules.
//!
//! A rule turns one detection into a fire / no-fire decision and, when a
//! pipeline dispatches, describes the alert. The pipeline engine is generic
//! over [`DecisionRule`]; the two shipped variants are licence-plate
//! deduplication and body-angle fall detection.

mod fall;
mod plate;

use std::time::Duration;

use crate::detect::Detection;

pub use fall::{compute_angle, is_fall_angle, FallAngleRule, FallRuleConfig, FALL_ALERT_LABEL};
pub use plate::{PlateDedupRule, DEFAULT_DUPLICATE_TIMEOUT, PLATE_ALERT_LABEL};

/// How fired decisions within one frame map to alerts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertPolicy {
    /// Every fired detection gets its own alert.
    PerDetection,
    /// At most one alert per frame, covering every subject that fired.
    PerFrame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Fired,
    NotFired,
    /// Would have fired, but the key alerted inside the dedup window.
    Suppressed,
    /// Required inputs missing or below confidence.
    Indeterminate,
    /// Detection is not something this rule evaluates.
    Skipped,
}

/// Quantity a rule derived from a detection.
#[derive(Clone, Debug, PartialEq)]
pub enum Metric {
    Angle(f64),
    Text(String),
}

/// Result of applying a rule to one detection.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub metric: Option<Metric>,
}

impl Decision {
    pub fn new(outcome: Outcome, metric: Option<Metric>) -> Self {
        Self { outcome, metric }
    }

    pub fn fired(&self) -> bool {
        self.outcome == Outcome::Fired
    }

    pub fn suppressed(&self) -> bool {
        self.outcome == Outcome::Suppressed
    }

    pub fn angle(&self) -> Option<f64> {
        match self.metric {
            Some(Metric::Angle(angle)) => Some(angle),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.metric {
            Some(Metric::Text(text)) => Some(text),
            _ => None,
        }
    }
}

/// A detection that fired, with its position in the frame's detection list.
#[derive(Clone, Copy, Debug)]
pub struct Fired<'a> {
    pub subject: usize,
    pub detection: &'a Detection,
    pub decision: &'a Decision,
}

/// What an alert says, independent of how it is delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertContent {
    pub label: String,
    pub confidence: f32,
    /// Stable key naming the subject of the alert (plate text, frame number).
    pub key: String,
    /// Variant-specific metadata fields sent alongside the standard ones.
    pub fields: Vec<(String, String)>,
}

pub trait DecisionRule: Send {
    fn name(&self) -> &'static str;

    fn alert_policy(&self) -> AlertPolicy;

    /// Evaluate one detection at monotonic time `now`.
    fn evaluate(&mut self, detection: &Detection, now: Duration) -> Decision;

    /// Build the alert for detections that fired in frame `frame_index`.
    /// `fired` is never empty.
    fn describe(&self, frame_index: u64, fired: &[Fired<'_>]) -> AlertContent;

    /// Image points that explain why `fired` fired, marked on the snapshot.
    fn markers(&self, _fired: &Fired<'_>) -> Vec<(f32, f32)> {
        Vec::new()
    }
}
