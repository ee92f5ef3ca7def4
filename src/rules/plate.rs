use std::collections::HashMap;
use std::time::Duration;

use super::{AlertContent, AlertPolicy, Decision, DecisionRule, Fired, Metric, Outcome};
use crate::detect::Detection;

pub const DEFAULT_DUPLICATE_TIMEOUT: Duration = Duration::from_secs(10);

pub const PLATE_ALERT_LABEL: &str = "plate_detected";

/// Fires for a recognised plate unless the same text alerted within the
/// duplicate timeout.
///
/// Keys are the exact recognised string (after trimming whitespace). Entries
/// are never evicted; a stale entry is simply overwritten on the next fire.
/// State is per rule instance, so two pipelines on the same camera do not
/// share it.
pub struct PlateDedupRule {
    duplicate_timeout: Duration,
    last_alerted: HashMap<String, Duration>,
}

impl PlateDedupRule {
    pub fn new(duplicate_timeout: Duration) -> Self {
        Self {
            duplicate_timeout,
            last_alerted: HashMap::new(),
        }
    }

    /// Number of plate texts ever alerted.
    pub fn tracked_plates(&self) -> usize {
        self.last_alerted.len()
    }
}

impl Default for PlateDedupRule {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_TIMEOUT)
    }
}

impl DecisionRule for PlateDedupRule {
    fn name(&self) -> &'static str {
        "plate_dedup"
    }

    fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy::PerDetection
    }

    fn evaluate(&mut self, detection: &Detection, now: Duration) -> Decision {
        let plate = match detection.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => return Decision::new(Outcome::Indeterminate, None),
        };

        if let Some(last) = self.last_alerted.get(&plate) {
            if now.saturating_sub(*last) < self.duplicate_timeout {
                return Decision::new(Outcome::Suppressed, Some(Metric::Text(plate)));
            }
        }

        self.last_alerted.insert(plate.clone(), now);
        Decision::new(Outcome::Fired, Some(Metric::Text(plate)))
    }

    fn describe(&self, _frame_index: u64, fired: &[Fired<'_>]) -> AlertContent {
        let first = fired.first();
        let plate = first
            .and_then(|f| f.decision.text())
            .unwrap_or_default()
            .to_string();
        AlertContent {
            label: PLATE_ALERT_LABEL.to_string(),
            confidence: first.map(|f| f.detection.confidence).unwrap_or(0.0),
            key: plate.clone(),
            fields: vec![("plate".to_string(), plate)],
        }
    }
}
