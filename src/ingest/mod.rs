//! Frame sources.
//!
//! This module provides the sources a pipeline can read frames from:
//! - Synthetic streams (`stub://`), paced at a configured frame rate
//! - HTTP MJPEG / single-JPEG snapshot endpoints (`http://`, `https://`)
//! - RTSP streams (`rtsp://`, feature: rtsp-gstreamer)
//! - Directories of JPEG frames (`file://`)
//! - Scripted sources (tests and replays)
//!
//! A source is opened once, read repeatedly, and closed by its owning pipeline.
//! `read` distinguishes end-of-stream from a transient `ReadFailed`; sources do
//! no buffering beyond what the transport already does.

pub mod file;
pub mod mjpeg;
pub mod rtsp;
pub mod scripted;
pub mod synthetic;

use std::time::{Duration, Instant};

use url::Url;

use crate::error::SourceError;
use crate::frame::Frame;

pub use file::FileSource;
pub use mjpeg::MjpegSource;
pub use rtsp::RtspSource;
pub use scripted::{ScriptedRead, ScriptedSource};
pub use synthetic::SyntheticSource;

/// Result of a successful read.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
}

/// Snapshot of a source's handle state.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub uri: String,
    pub open: bool,
    pub frames_read: u64,
    pub last_read_at: Option<Instant>,
}

/// An open video stream handle.
pub trait FrameSource: Send {
    fn uri(&self) -> &str;

    /// Read and decode the next frame.
    fn read(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Advance past the next frame without handing it out.
    /// Returns `Ok(false)` at end of stream.
    fn grab(&mut self) -> Result<bool, SourceError> {
        match self.read()? {
            ReadOutcome::Frame(_) => Ok(true),
            ReadOutcome::EndOfStream => Ok(false),
        }
    }

    /// Frame rate reported by the transport, if any.
    fn fps(&self) -> Option<f64> {
        None
    }

    fn stats(&self) -> SourceStats;

    /// Release the underlying transport. Idempotent.
    fn close(&mut self);
}

/// Settings applied when opening sources by URI.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Frame rate of synthetic `stub://` sources.
    pub stub_fps: f64,
    pub stub_width: u32,
    pub stub_height: u32,
    /// Connect timeout for network sources.
    pub connect_timeout: Duration,
    /// Per-read timeout for network sources.
    pub read_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            stub_fps: 10.0,
            stub_width: 640,
            stub_height: 480,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a source for `uri`, choosing the backend by scheme.
pub fn open_source(
    uri: &str,
    settings: &SourceSettings,
) -> Result<Box<dyn FrameSource>, SourceError> {
    let url = Url::parse(uri)
        .map_err(|e| SourceError::Unavailable(format!("invalid source uri '{}': {}", uri, e)))?;
    match url.scheme() {
        "stub" => Ok(Box::new(SyntheticSource::open(uri, settings)?)),
        "http" | "https" => Ok(Box::new(MjpegSource::open(uri, settings)?)),
        "rtsp" | "rtsps" => Ok(Box::new(RtspSource::open(uri, settings)?)),
        "file" => Ok(Box::new(FileSource::open(&url)?)),
        other => Err(SourceError::Unavailable(format!(
            "unsupported source scheme '{}'",
            other
        ))),
    }
}
