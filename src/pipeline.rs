//! Generic stream pipeline.
//!
//! One pipeline binds one frame source to one decision rule:
//!
//! ```text
//! FrameSource -> Sampler -> DetectorBackend -> DecisionRule -> AlertDispatcher
//! ```
//!
//! Frames are processed strictly in source order on the calling thread.
//! Cancellation is polled at the top of every iteration and inside every
//! wait, so a stop takes effect within one sampling interval plus one read.
//! Nothing that happens to a single frame (inference failure, dispatch
//! failure, audit write failure) ends the run; only cancellation, end of
//! stream, an unavailable source or too many consecutive read failures do.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::clock::{CancelToken, Clock};
use crate::detect::{filter_confident, Detection, DetectorBackend};
use crate::dispatch::{Alert, AlertDispatcher};
use crate::error::SourceError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::rules::{AlertPolicy, Decision, DecisionRule, Fired, Outcome};
use crate::sampler::{Sample, Sampler, SamplingPolicy};

const OVERLAY_RGB: [u8; 3] = [0, 255, 0];
const MARKER_RGB: [u8; 3] = [255, 0, 0];

/// Alerts kept in a report; older ones are only counted.
pub const RECENT_ALERT_LIMIT: usize = 32;

/// Which detector/rule pairing a pipeline runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    /// Licence plates, deduplicated by recognised text.
    Plate,
    /// Falls, judged from the shoulder/hip angle of each person.
    Fall,
}

impl DetectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionKind::Plate => "plate",
            DetectionKind::Fall => "fall",
        }
    }

    pub fn default_interval(self) -> Duration {
        Duration::from_secs(2)
    }

    /// Plates are sampled on a timer; falls on a frame stride derived from
    /// the source frame rate.
    pub fn default_policy(self) -> SamplingPolicy {
        match self {
            DetectionKind::Plate => SamplingPolicy::time_gated(self.default_interval()),
            DetectionKind::Fall => SamplingPolicy::frame_stride(self.default_interval()),
        }
    }

    /// Whether per-subject decisions are written to the CSV audit log.
    pub fn writes_audit_log(self) -> bool {
        matches!(self, DetectionKind::Fall)
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plate" | "alpr" | "anpr" => Ok(DetectionKind::Plate),
            "fall" | "pose" => Ok(DetectionKind::Fall),
            other => Err(anyhow!("unknown detection kind '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Detections below this confidence never reach the rule.
    pub min_confidence: f32,
    /// Delay before retrying after a failed read.
    pub read_retry: Duration,
    /// Consecutive failed reads after which the pipeline gives up (0 = never).
    pub max_read_failures: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.25,
            read_retry: Duration::from_secs(1),
            max_read_failures: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    Cancelled,
    EndOfStream,
    SourceUnavailable(String),
    ReadFailures(String),
}

/// Summary of a finished run.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub source_uri: String,
    pub samples: u64,
    pub read_failures: u64,
    pub inference_errors: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    /// The last [`RECENT_ALERT_LIMIT`] alerts, oldest first.
    pub recent_alerts: VecDeque<Alert>,
    pub end: EndReason,
}

impl PipelineReport {
    fn new(source_uri: String) -> Self {
        Self {
            source_uri,
            samples: 0,
            read_failures: 0,
            inference_errors: 0,
            alerts_sent: 0,
            alerts_failed: 0,
            recent_alerts: VecDeque::with_capacity(RECENT_ALERT_LIMIT),
            end: EndReason::Cancelled,
        }
    }

    pub fn alerts(&self) -> u64 {
        self.alerts_sent + self.alerts_failed
    }

    fn record_alert(&mut self, alert: Alert) {
        if alert.status.is_sent() {
            self.alerts_sent += 1;
        } else {
            self.alerts_failed += 1;
        }
        if self.recent_alerts.len() == RECENT_ALERT_LIMIT {
            self.recent_alerts.pop_front();
        }
        self.recent_alerts.push_back(alert);
    }
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    sampler: Sampler,
    detector: Box<dyn DetectorBackend>,
    rule: Box<dyn DecisionRule>,
    dispatcher: AlertDispatcher,
    audit: Option<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl Pipeline {
    /// A frame-stride sampler takes its stride from the source's frame rate,
    /// as reported now or after the first frame is read.
    pub fn new(
        source: Box<dyn FrameSource>,
        policy: SamplingPolicy,
        detector: Box<dyn DetectorBackend>,
        rule: Box<dyn DecisionRule>,
        dispatcher: AlertDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sampler = Sampler::new(policy, source.fps());
        Self {
            source,
            sampler,
            detector,
            rule,
            dispatcher,
            audit: None,
            clock,
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn source_uri(&self) -> &str {
        self.source.uri()
    }

    /// Run until cancelled or the source ends. The source is closed on return.
    pub fn run(mut self, cancel: &CancelToken) -> PipelineReport {
        let source_uri = self.source.uri().to_string();
        log::info!(
            "pipeline {}: running rule {} with detector {}",
            source_uri,
            self.rule.name(),
            self.detector.name()
        );

        let mut report = PipelineReport::new(source_uri.clone());
        let mut consecutive_failures: u32 = 0;

        let end = loop {
            if cancel.is_cancelled() {
                break EndReason::Cancelled;
            }
            let sample =
                match self
                    .sampler
                    .next(self.source.as_mut(), self.clock.as_ref(), cancel)
                {
                    Ok(sample) => {
                        consecutive_failures = 0;
                        sample
                    }
                    Err(SourceError::ReadFailed(reason)) => {
                        report.read_failures += 1;
                        consecutive_failures += 1;
                        log::warn!(
                            "pipeline {}: read failed ({}/{}): {}",
                            source_uri,
                            consecutive_failures,
                            self.settings.max_read_failures,
                            reason
                        );
                        if self.settings.max_read_failures > 0
                            && consecutive_failures >= self.settings.max_read_failures
                        {
                            break EndReason::ReadFailures(reason);
                        }
                        if self.clock.sleep(self.settings.read_retry, cancel) {
                            break EndReason::Cancelled;
                        }
                        continue;
                    }
                    Err(SourceError::Unavailable(reason)) => {
                        break EndReason::SourceUnavailable(reason);
                    }
                };
            match sample {
                Sample::Cancelled => break EndReason::Cancelled,
                Sample::EndOfStream => break EndReason::EndOfStream,
                Sample::Frame { index, frame } => {
                    report.samples += 1;
                    self.process(index, frame, &mut report);
                }
            }
        };

        self.source.close();
        match &end {
            EndReason::SourceUnavailable(reason) | EndReason::ReadFailures(reason) => {
                log::error!("pipeline {}: stopped: {}", source_uri, reason)
            }
            other => log::info!(
                "pipeline {}: stopped ({:?}) after {} samples, {} alerts ({} failed)",
                source_uri,
                other,
                report.samples,
                report.alerts(),
                report.alerts_failed
            ),
        }
        report.end = end;
        report
    }

    fn process(&mut self, index: u64, mut frame: Frame, report: &mut PipelineReport) {
        let detections = match self.detector.detect(&frame) {
            Ok(detections) => filter_confident(detections, self.settings.min_confidence),
            Err(err) => {
                report.inference_errors += 1;
                log::warn!(
                    "pipeline {}: frame {}: {}",
                    self.source.uri(),
                    index,
                    err
                );
                return;
            }
        };
        log::debug!(
            "pipeline {}: frame {}: {} detections",
            self.source.uri(),
            index,
            detections.len()
        );

        let now = self.clock.now();
        let decisions: Vec<Decision> = detections
            .iter()
            .map(|detection| self.rule.evaluate(detection, now))
            .collect();

        if let Some(audit) = self.audit.as_mut() {
            for (subject, decision) in decisions.iter().enumerate() {
                if decision.outcome == Outcome::Skipped {
                    continue;
                }
                if let Err(err) = audit.record(index, subject, decision.angle(), decision.fired()) {
                    log::warn!("audit log {}: {:#}", audit.path().display(), err);
                }
            }
        }

        let fired: Vec<Fired<'_>> = detections
            .iter()
            .zip(decisions.iter())
            .enumerate()
            .filter(|(_, (_, decision))| decision.fired())
            .map(|(subject, (detection, decision))| Fired {
                subject,
                detection,
                decision,
            })
            .collect();
        for (detection, decision) in detections.iter().zip(decisions.iter()) {
            if decision.suppressed() {
                log::debug!(
                    "pipeline {}: {} suppressed inside dedup window",
                    self.source.uri(),
                    detection.text.as_deref().unwrap_or(&detection.label)
                );
            }
        }
        if fired.is_empty() {
            return;
        }

        burn_in(&mut frame, &detections, &fired, self.rule.as_ref());
        let timestamp = self.clock.timestamp();
        match self.rule.alert_policy() {
            AlertPolicy::PerDetection => {
                for one in &fired {
                    let content = self.rule.describe(index, std::slice::from_ref(one));
                    report.record_alert(self.dispatcher.dispatch(&content, &timestamp, &frame));
                }
            }
            AlertPolicy::PerFrame => {
                let content = self.rule.describe(index, &fired);
                report.record_alert(self.dispatcher.dispatch(&content, &timestamp, &frame));
            }
        }
    }
}

/// Boxes around every detection, plus the rule's markers for each one that fired.
fn burn_in(
    frame: &mut Frame,
    detections: &[Detection],
    fired: &[Fired<'_>],
    rule: &dyn DecisionRule,
) {
    for detection in detections {
        if let Some(b) = detection.bbox {
            frame.draw_rect(b.x1, b.y1, b.x2, b.y2, OVERLAY_RGB);
        }
    }
    for one in fired {
        for (x, y) in rule.markers(one) {
            frame.draw_marker(x, y, MARKER_RGB);
        }
    }
}
