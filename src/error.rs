//! Error kinds the pipeline loop branches on.
//!
//! Everything else in the crate reports failures through `anyhow`.

use std::fmt;

/// Failure reported by a frame source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceError {
    /// The stream could not be opened. Terminal; the pipeline aborts.
    Unavailable(String),
    /// A single read failed. Transient; the caller backs off and retries.
    ReadFailed(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "source unavailable: {}", msg),
            SourceError::ReadFailed(msg) => write!(f, "read failed: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Failure reported by a detector backend. Skips the current sample only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InferenceError(pub String);

impl InferenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inference error: {}", self.0)
    }
}

impl std::error::Error for InferenceError {}
