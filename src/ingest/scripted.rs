//! Deterministic frame source driven by a fixed script.
//!
//! Each read pops the next scripted step. Optionally advances a
//! [`ManualClock`] per read so sampling behaviour can be checked against
//! virtual time, and exposes its open/closed state through a shared flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FrameSource, ReadOutcome, SourceStats};
use crate::clock::ManualClock;
use crate::error::SourceError;
use crate::frame::Frame;

/// One scripted read result.
#[derive(Clone, Debug)]
pub enum ScriptedRead {
    Frame(Frame),
    Fail(String),
    End,
}

pub struct ScriptedSource {
    uri: String,
    script: VecDeque<ScriptedRead>,
    repeat: Option<Frame>,
    fps: Option<f64>,
    late_fps: Option<f64>,
    clock: Option<(ManualClock, Duration)>,
    open: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
    frames_read: u64,
    last_read_at: Option<Instant>,
}

impl ScriptedSource {
    pub fn new(uri: impl Into<String>, script: Vec<ScriptedRead>) -> Self {
        Self {
            uri: uri.into(),
            script: script.into(),
            repeat: None,
            fps: None,
            late_fps: None,
            clock: None,
            open: Arc::new(AtomicBool::new(true)),
            reads: Arc::new(AtomicU64::new(0)),
            frames_read: 0,
            last_read_at: None,
        }
    }

    /// `count` copies of `frame`, then end of stream.
    pub fn frames(uri: impl Into<String>, frame: Frame, count: usize) -> Self {
        Self::new(uri, vec![ScriptedRead::Frame(frame); count])
    }

    /// Yield `frame` forever once the script is exhausted.
    pub fn repeating(mut self, frame: Frame) -> Self {
        self.repeat = Some(frame);
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Report `fps` only once a frame has been read, like transports that
    /// learn the rate from the first decoded sample.
    pub fn with_fps_after_first_frame(mut self, fps: f64) -> Self {
        self.late_fps = Some(fps);
        self
    }

    /// Advance `clock` by `per_read` on every read, as a live stream would.
    pub fn with_clock(mut self, clock: ManualClock, per_read: Duration) -> Self {
        self.clock = Some((clock, per_read));
        self
    }

    /// Shared flag that turns `false` once the source is closed.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// Shared counter of read attempts.
    pub fn read_counter(&self) -> Arc<AtomicU64> {
        self.reads.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SourceError::ReadFailed("source closed".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, per_read)) = &self.clock {
            clock.advance(*per_read);
        }
        let step = match self.script.pop_front() {
            Some(step) => step,
            None => match &self.repeat {
                Some(frame) => ScriptedRead::Frame(frame.clone()),
                None => ScriptedRead::End,
            },
        };
        match step {
            ScriptedRead::Frame(frame) => {
                self.frames_read += 1;
                self.last_read_at = Some(Instant::now());
                Ok(ReadOutcome::Frame(frame))
            }
            ScriptedRead::Fail(reason) => Err(SourceError::ReadFailed(reason)),
            ScriptedRead::End => Ok(ReadOutcome::EndOfStream),
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
            .or(if self.frames_read > 0 { self.late_fps } else { None })
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            uri: self.uri.clone(),
            open: self.open.load(Ordering::SeqCst),
            frames_read: self.frames_read,
            last_read_at: self.last_read_at,
        }
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
