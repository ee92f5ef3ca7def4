use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Backend that replays a fixed sequence of results, one per call.
/// Once the script runs out every call returns no detections.
pub struct ScriptedBackend {
    script: VecDeque<Result<Vec<Detection>, InferenceError>>,
    calls: Arc<AtomicU64>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Vec<Detection>, InferenceError>>) -> Self {
        Self {
            script: script.into(),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of `detect` calls.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
