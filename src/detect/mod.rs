mod backend;
mod backends;
mod result;

pub use backend::{filter_confident, DetectorBackend};
pub use backends::{HttpBackend, HttpBackendConfig, ScriptedBackend};
pub use result::{
    BoundingBox, Detection, Keypoint, COCO_KEYPOINT_COUNT, LEFT_HIP, LEFT_SHOULDER, PERSON_LABEL,
};
