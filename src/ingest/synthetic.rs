//! Synthetic frame source for `stub://` URIs.
//!
//! Produces solid frames whose colour drifts over time, paced to the
//! configured frame rate like a live camera would be. `?frames=N` ends the
//! stream after N frames; `?fps=F` overrides the frame rate.

use std::time::{Duration, Instant};

use url::Url;

use super::{FrameSource, ReadOutcome, SourceSettings, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct SyntheticSource {
    uri: String,
    fps: f64,
    period: Duration,
    width: u32,
    height: u32,
    limit: Option<u64>,
    frame_count: u64,
    last_read_at: Option<Instant>,
    open: bool,
}

impl SyntheticSource {
    pub fn open(uri: &str, settings: &SourceSettings) -> Result<Self, SourceError> {
        let url = Url::parse(uri)
            .map_err(|e| SourceError::Unavailable(format!("invalid stub uri '{}': {}", uri, e)))?;
        let mut fps = settings.stub_fps;
        let mut limit = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    limit = Some(value.parse::<u64>().map_err(|_| {
                        SourceError::Unavailable(format!("invalid frames value '{}'", value))
                    })?)
                }
                "fps" => {
                    fps = value.parse::<f64>().map_err(|_| {
                        SourceError::Unavailable(format!("invalid fps value '{}'", value))
                    })?
                }
                _ => {}
            }
        }
        if fps <= 0.0 || !fps.is_finite() {
            return Err(SourceError::Unavailable(format!(
                "synthetic fps must be positive, got {}",
                fps
            )));
        }
        let period = Duration::try_from_secs_f64(1.0 / fps).map_err(|_| {
            SourceError::Unavailable(format!("synthetic fps {} gives no usable frame period", fps))
        })?;
        log::info!("SyntheticSource: opened {} at {:.1} fps", uri, fps);
        Ok(Self {
            uri: uri.to_string(),
            fps,
            period,
            width: settings.stub_width,
            height: settings.stub_height,
            limit,
            frame_count: 0,
            last_read_at: None,
            open: true,
        })
    }

    fn pace(&self) {
        let Some(last) = self.last_read_at else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < self.period {
            std::thread::sleep(self.period - elapsed);
        }
    }

    fn scene_colour(&self) -> [u8; 3] {
        // Change scene every 50 frames to simulate activity.
        let scene = (self.frame_count / 50) as u8;
        [
            scene.wrapping_mul(40),
            (self.frame_count % 256) as u8,
            128,
        ]
    }
}

impl FrameSource for SyntheticSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        if !self.open {
            return Err(SourceError::ReadFailed("source closed".to_string()));
        }
        if self.limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(ReadOutcome::EndOfStream);
        }
        self.pace();
        let frame = Frame::filled(self.width, self.height, self.scene_colour());
        self.frame_count += 1;
        self.last_read_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(frame))
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            uri: self.uri.clone(),
            open: self.open,
            frames_read: self.frame_count,
            last_read_at: self.last_read_at,
        }
    }

    fn close(&mut self) {
        if self.open {
            log::info!("SyntheticSource: closed {}", self.uri);
        }
        self.open = false;
    }
}
