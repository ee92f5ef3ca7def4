use crate::detect::result::Detection;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Detector backend trait.
///
/// The model behind a backend is opaque to the pipeline: it sees only the
/// structured detections. An `InferenceError` skips the current sample and
/// never stops the pipeline.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

/// Drop detections whose overall confidence is below `min_confidence`.
pub fn filter_confident(detections: Vec<Detection>, min_confidence: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= min_confidence)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keeps_threshold_and_above() {
        let kept = filter_confident(
            vec![
                Detection::new("a", 0.1),
                Detection::new("b", 0.25),
                Detection::new("c", 0.9),
            ],
            0.25,
        );
        let labels: Vec<_> = kept.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "c"]);
    }
}
