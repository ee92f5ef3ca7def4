//! Frame sampling.
//!
//! Bounds inference cost by forwarding only some frames downstream:
//! - time-gated: at most one frame per `interval` of clock time
//! - frame-stride: every `stride`-th frame, with `stride = round(fps * interval)`
//!   (or a fixed default when the source reports no usable frame rate)
//!
//! All waiting goes through the injected [`Clock`], so a raised
//! [`CancelToken`] interrupts the wait and tests can use virtual time.
//! Discarded frames are dropped immediately, never queued.

use std::time::Duration;

use crate::clock::{CancelToken, Clock};
use crate::error::SourceError;
use crate::frame::Frame;
use crate::ingest::{FrameSource, ReadOutcome};

/// Stride used when the source reports no frame rate.
pub const DEFAULT_STRIDE: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingPolicy {
    /// Sample when at least `interval` has passed since the previous sample.
    /// With `drain`, frames arriving in between are read and discarded
    /// instead of sleeping, which keeps live streams from going stale.
    TimeGated { interval: Duration, drain: bool },
    /// Sample every `round(fps * interval)`-th frame.
    FrameStride {
        interval: Duration,
        default_stride: u64,
    },
}

impl SamplingPolicy {
    pub fn time_gated(interval: Duration) -> Self {
        SamplingPolicy::TimeGated {
            interval,
            drain: false,
        }
    }

    pub fn frame_stride(interval: Duration) -> Self {
        SamplingPolicy::FrameStride {
            interval,
            default_stride: DEFAULT_STRIDE,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            SamplingPolicy::TimeGated { interval, .. } => *interval,
            SamplingPolicy::FrameStride { interval, .. } => *interval,
        }
    }
}

fn usable_fps(fps: Option<f64>) -> Option<f64> {
    fps.filter(|fps| fps.is_finite() && *fps > 0.0)
}

/// Frame stride for a source running at `fps`.
pub fn stride_for(fps: Option<f64>, interval: Duration, default_stride: u64) -> u64 {
    match usable_fps(fps) {
        Some(fps) => ((fps * interval.as_secs_f64()).round() as u64).max(1),
        None => default_stride.max(1),
    }
}

/// What the sampler produced.
#[derive(Debug)]
pub enum Sample {
    /// A frame to run inference on; `index` counts every frame read from the
    /// source, sampled or not.
    Frame { index: u64, frame: Frame },
    EndOfStream,
    Cancelled,
}

pub struct Sampler {
    policy: SamplingPolicy,
    stride: u64,
    /// Stride still waits on the source's frame rate, which some transports
    /// only learn from the first decoded frame.
    stride_pending: bool,
    last_sample_at: Option<Duration>,
    next_index: u64,
    samples: u64,
}

impl Sampler {
    pub fn new(policy: SamplingPolicy, source_fps: Option<f64>) -> Self {
        let (stride, stride_pending) = match policy {
            SamplingPolicy::FrameStride {
                interval,
                default_stride,
            } => (
                stride_for(source_fps, interval, default_stride),
                usable_fps(source_fps).is_none(),
            ),
            SamplingPolicy::TimeGated { .. } => (1, false),
        };
        Self {
            policy,
            stride,
            stride_pending,
            last_sample_at: None,
            next_index: 0,
            samples: 0,
        }
    }

    /// Effective frame stride (1 for time-gated sampling). Until the first
    /// frame is read this may still be the default for an unknown rate.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples
    }

    /// Block until the next frame is due and return it.
    ///
    /// Read failures propagate unchanged so the caller can back off; the
    /// sampler's position is kept, so the retry picks up where it left off.
    pub fn next(
        &mut self,
        source: &mut dyn FrameSource,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<Sample, SourceError> {
        match self.policy {
            SamplingPolicy::TimeGated { interval, drain } => {
                self.next_time_gated(source, clock, cancel, interval, drain)
            }
            SamplingPolicy::FrameStride { .. } => self.next_strided(source, cancel),
        }
    }

    fn next_time_gated(
        &mut self,
        source: &mut dyn FrameSource,
        clock: &dyn Clock,
        cancel: &CancelToken,
        interval: Duration,
        drain: bool,
    ) -> Result<Sample, SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(Sample::Cancelled);
            }
            let now = clock.now();
            let due = self.last_sample_at.map(|last| last + interval).unwrap_or(now);
            if now >= due {
                return match source.read()? {
                    ReadOutcome::Frame(frame) => {
                        self.last_sample_at = Some(now);
                        Ok(self.emit(frame))
                    }
                    ReadOutcome::EndOfStream => Ok(Sample::EndOfStream),
                };
            }
            if drain {
                if !source.grab()? {
                    return Ok(Sample::EndOfStream);
                }
                self.next_index += 1;
            } else if clock.sleep(due - now, cancel) {
                return Ok(Sample::Cancelled);
            }
        }
    }

    fn next_strided(
        &mut self,
        source: &mut dyn FrameSource,
        cancel: &CancelToken,
    ) -> Result<Sample, SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(Sample::Cancelled);
            }
            if self.next_index % self.stride == 0 {
                return match source.read()? {
                    ReadOutcome::Frame(frame) => {
                        self.resolve_stride(source.fps());
                        Ok(self.emit(frame))
                    }
                    ReadOutcome::EndOfStream => Ok(Sample::EndOfStream),
                };
            }
            // Always consume intermediate frames so the transport never backs up.
            if !source.grab()? {
                return Ok(Sample::EndOfStream);
            }
            self.next_index += 1;
        }
    }

    /// Fix the stride from the rate the source reports after its first frame.
    /// A source that still reports nothing keeps the default stride.
    fn resolve_stride(&mut self, fps: Option<f64>) {
        if !self.stride_pending {
            return;
        }
        self.stride_pending = false;
        if let SamplingPolicy::FrameStride {
            interval,
            default_stride,
        } = self.policy
        {
            self.stride = stride_for(fps, interval, default_stride);
            log::debug!("sampler: frame stride {} (source fps {:?})", self.stride, fps);
        }
    }

    fn emit(&mut self, frame: Frame) -> Sample {
        let index = self.next_index;
        self.next_index += 1;
        self.samples += 1;
        Sample::Frame { index, frame }
    }
}
