//! RTSP frame source.
//!
//! Decodes RTSP streams with GStreamer (`rtspsrc ! decodebin ! videoconvert !
//! appsink`) when built with the `rtsp-gstreamer` feature. Without the feature,
//! opening an `rtsp://` URI reports the source as unavailable.

#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::{FrameSource, ReadOutcome, SourceSettings, SourceStats};
use crate::error::SourceError;
#[cfg(feature = "rtsp-gstreamer")]
use crate::frame::Frame;

pub struct RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    inner: GstreamerRtspSource,
    #[cfg(not(feature = "rtsp-gstreamer"))]
    uri: String,
}

impl RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    pub fn open(uri: &str, settings: &SourceSettings) -> Result<Self, SourceError> {
        let mut inner = GstreamerRtspSource::new(uri, settings)
            .map_err(|e| SourceError::Unavailable(format!("{:#}", e)))?;
        inner
            .connect()
            .map_err(|e| SourceError::Unavailable(format!("{:#}", e)))?;
        Ok(Self { inner })
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    pub fn open(uri: &str, _settings: &SourceSettings) -> Result<Self, SourceError> {
        Err(SourceError::Unavailable(format!(
            "{}: RTSP requires the rtsp-gstreamer feature",
            uri
        )))
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl FrameSource for RtspSource {
    fn uri(&self) -> &str {
        &self.inner.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        self.inner.next_frame()
    }

    fn fps(&self) -> Option<f64> {
        self.inner.fps
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(not(feature = "rtsp-gstreamer"))]
impl FrameSource for RtspSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        Err(SourceError::ReadFailed("RTSP support not compiled in".to_string()))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            uri: self.uri.clone(),
            open: false,
            frames_read: 0,
            last_read_at: None,
        }
    }

    fn close(&mut self) {}
}

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    uri: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    fps: Option<f64>,
    frame_count: u64,
    last_read_at: Option<Instant>,
    reached_eos: bool,
    open: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(uri: &str, settings: &SourceSettings) -> anyhow::Result<Self> {
        use anyhow::Context;
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=false",
            uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_sync(false);

        Ok(Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            read_timeout: settings.read_timeout,
            fps: None,
            frame_count: 0,
            last_read_at: None,
            reached_eos: false,
            open: false,
        })
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.open = true;
        log::info!("RtspSource: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<ReadOutcome, SourceError> {
        if !self.open {
            return Err(SourceError::ReadFailed("source closed".to_string()));
        }
        self.poll_bus()?;
        if self.reached_eos || self.appsink.is_eos() {
            return Ok(ReadOutcome::EndOfStream);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Ok(ReadOutcome::EndOfStream);
            }
            return Err(SourceError::ReadFailed("RTSP stream stalled".to_string()));
        };

        let (pixels, width, height, fps) =
            sample_to_pixels(&sample).map_err(|e| SourceError::ReadFailed(format!("{:#}", e)))?;
        if fps.is_some() {
            self.fps = fps;
        }
        let frame = Frame::from_rgb(pixels, width, height)
            .map_err(|e| SourceError::ReadFailed(format!("{:#}", e)))?;

        self.frame_count += 1;
        self.last_read_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(frame))
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
        use gstreamer::prelude::*;

        if !self.open {
            return;
        }
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.uri, e);
        }
        self.open = false;
        log::info!("RtspSource: closed {}", self.uri);
    }

    fn poll_bus(&mut self) -> Result<(), SourceError> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(SourceError::ReadFailed(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => {
                    self.reached_eos = true;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> anyhow::Result<(Vec<u8>, u32, u32, Option<f64>)> {
    use anyhow::Context;

    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let fps = {
        let rate = info.fps();
        if rate.numer() > 0 && rate.denom() > 0 {
            Some(rate.numer() as f64 / rate.denom() as f64)
        } else {
            None
        }
    };

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height, fps));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height, fps))
}
