use serde::{Deserialize, Serialize};

/// Label detectors use for people.
pub const PERSON_LABEL: &str = "person";

/// COCO pose keypoint layout.
pub const COCO_KEYPOINT_COUNT: usize = 17;
pub const LEFT_SHOULDER: usize = 5;
pub const LEFT_HIP: usize = 11;

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One landmark with its own confidence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// One model output for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// 0..1; for plates this is the OCR confidence.
    pub confidence: f32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
    /// Recognised text (licence plates).
    #[serde(default)]
    pub text: Option<String>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox: None,
            keypoints: Vec::new(),
            text: None,
        }
    }

    pub fn plate(text: impl Into<String>, confidence: f32) -> Self {
        Self::new("plate", confidence).with_text(text)
    }

    pub fn person(confidence: f32, keypoints: Vec<Keypoint>) -> Self {
        Self::new(PERSON_LABEL, confidence).with_keypoints(keypoints)
    }

    pub fn with_bbox(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Some(BoundingBox { x1, y1, x2, y2 });
        self
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn keypoint(&self, index: usize) -> Option<&Keypoint> {
        self.keypoints.get(index)
    }
}
