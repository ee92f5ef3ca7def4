use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::SourceSettings;
use crate::pipeline::{DetectionKind, PipelineSettings};
use crate::rules::FallRuleConfig;
use crate::sampler::{SamplingPolicy, DEFAULT_STRIDE};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_AUDIT_LOG: &str = "alerts.csv";
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;
const DEFAULT_DUPLICATE_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_READ_RETRY_MS: u64 = 1000;
const DEFAULT_MAX_READ_FAILURES: u32 = 30;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    kind: Option<String>,
    snapshot_dir: Option<PathBuf>,
    audit_log: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    sampling: Option<SamplingConfigFile>,
    rules: Option<RulesConfigFile>,
    source: Option<SourceConfigFile>,
    dispatch: Option<DispatchConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    url: Option<String>,
    timeout_secs: Option<u64>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    policy: Option<String>,
    interval_secs: Option<f64>,
    default_stride: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    duplicate_timeout_secs: Option<f64>,
    min_keypoint_confidence: Option<f32>,
    fall_angle_low: Option<f64>,
    fall_angle_high: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    read_retry_ms: Option<u64>,
    max_read_failures: Option<u32>,
    stub_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    timeout_secs: Option<u64>,
}

/// How frames are picked for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Time,
    Frames,
}

impl PolicyKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "time" | "time-gated" | "time_gated" => Ok(PolicyKind::Time),
            "frames" | "frame-stride" | "frame_stride" | "stride" => Ok(PolicyKind::Frames),
            other => Err(anyhow!(
                "sampling policy must be 'time' or 'frames', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub api_addr: String,
    /// Kind used when a start request does not name one.
    pub kind: DetectionKind,
    pub snapshot_dir: PathBuf,
    pub audit_log: PathBuf,
    pub detector: DetectorSettings,
    pub sampling: SamplingSettings,
    pub rules: RuleSettings,
    pub source: SourceConfig,
    pub dispatch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub url: Option<String>,
    pub timeout: Duration,
    pub min_confidence: f32,
}

/// Unset fields fall back to the per-kind preset.
#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub policy: Option<PolicyKind>,
    pub interval: Option<Duration>,
    pub default_stride: u64,
}

#[derive(Debug, Clone)]
pub struct RuleSettings {
    pub duplicate_timeout: Duration,
    pub fall: FallRuleConfig,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub read_retry: Duration,
    pub max_read_failures: u32,
    pub stub_fps: f64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            kind: DetectionKind::Plate,
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            audit_log: PathBuf::from(DEFAULT_AUDIT_LOG),
            detector: DetectorSettings {
                url: None,
                timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
                min_confidence: DEFAULT_MIN_CONFIDENCE,
            },
            sampling: SamplingSettings {
                policy: None,
                interval: None,
                default_stride: DEFAULT_STRIDE,
            },
            rules: RuleSettings {
                duplicate_timeout: Duration::from_secs_f64(DEFAULT_DUPLICATE_TIMEOUT_SECS),
                fall: FallRuleConfig::default(),
            },
            source: SourceConfig {
                read_retry: Duration::from_millis(DEFAULT_READ_RETRY_MS),
                max_read_failures: DEFAULT_MAX_READ_FAILURES,
                stub_fps: SourceSettings::default().stub_fps,
            },
            dispatch_timeout: Duration::from_secs(DEFAULT_DISPATCH_TIMEOUT_SECS),
        }
    }
}

impl SentinelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(kind) = file.kind.as_deref() {
            cfg.kind = kind.parse()?;
        }
        if let Some(dir) = file.snapshot_dir {
            cfg.snapshot_dir = dir;
        }
        if let Some(path) = file.audit_log {
            cfg.audit_log = path;
        }
        if let Some(addr) = file.api.and_then(|api| api.addr) {
            cfg.api_addr = addr;
        }
        if let Some(detector) = file.detector {
            cfg.detector.url = detector.url.filter(|url| !url.trim().is_empty());
            if let Some(secs) = detector.timeout_secs {
                cfg.detector.timeout = Duration::from_secs(secs);
            }
            if let Some(min) = detector.min_confidence {
                cfg.detector.min_confidence = min;
            }
        }
        if let Some(sampling) = file.sampling {
            cfg.sampling.policy = sampling.policy.as_deref().map(PolicyKind::parse).transpose()?;
            cfg.sampling.interval = sampling.interval_secs.map(secs_f64).transpose()?;
            if let Some(stride) = sampling.default_stride {
                cfg.sampling.default_stride = stride;
            }
        }
        if let Some(rules) = file.rules {
            if let Some(secs) = rules.duplicate_timeout_secs {
                cfg.rules.duplicate_timeout = secs_f64(secs)?;
            }
            if let Some(conf) = rules.min_keypoint_confidence {
                cfg.rules.fall.min_keypoint_confidence = conf;
            }
            if let Some(low) = rules.fall_angle_low {
                cfg.rules.fall.angle_low = low;
            }
            if let Some(high) = rules.fall_angle_high {
                cfg.rules.fall.angle_high = high;
            }
        }
        if let Some(source) = file.source {
            if let Some(ms) = source.read_retry_ms {
                cfg.source.read_retry = Duration::from_millis(ms);
            }
            if let Some(max) = source.max_read_failures {
                cfg.source.max_read_failures = max;
            }
            if let Some(fps) = source.stub_fps {
                cfg.source.stub_fps = fps;
            }
        }
        if let Some(secs) = file.dispatch.and_then(|dispatch| dispatch.timeout_secs) {
            cfg.dispatch_timeout = Duration::from_secs(secs);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SENTINEL_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(kind) = std::env::var("SENTINEL_KIND") {
            if !kind.trim().is_empty() {
                self.kind = kind.parse()?;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("SENTINEL_AUDIT_LOG") {
            if !path.trim().is_empty() {
                self.audit_log = PathBuf::from(path);
            }
        }
        if let Ok(url) = std::env::var("SENTINEL_DETECTOR_URL") {
            if !url.trim().is_empty() {
                self.detector.url = Some(url);
            }
        }
        if let Ok(policy) = std::env::var("SENTINEL_SAMPLING_POLICY") {
            if !policy.trim().is_empty() {
                self.sampling.policy = Some(PolicyKind::parse(&policy)?);
            }
        }
        if let Ok(interval) = std::env::var("SENTINEL_SAMPLE_INTERVAL_SECS") {
            let secs: f64 = interval.trim().parse().map_err(|_| {
                anyhow!("SENTINEL_SAMPLE_INTERVAL_SECS must be a number of seconds")
            })?;
            self.sampling.interval = Some(secs_f64(secs)?);
        }
        if let Ok(timeout) = std::env::var("SENTINEL_DUPLICATE_TIMEOUT_SECS") {
            let secs: f64 = timeout.trim().parse().map_err(|_| {
                anyhow!("SENTINEL_DUPLICATE_TIMEOUT_SECS must be a number of seconds")
            })?;
            self.rules.duplicate_timeout = secs_f64(secs)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.api_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!("api addr '{}' is not a socket address", self.api_addr));
        }
        if let Some(url) = &self.detector.url {
            url::Url::parse(url).map_err(|e| anyhow!("detector url '{}': {}", url, e))?;
        }
        check_unit("detector.min_confidence", self.detector.min_confidence)?;
        check_unit(
            "rules.min_keypoint_confidence",
            self.rules.fall.min_keypoint_confidence,
        )?;
        let fall = &self.rules.fall;
        if !(0.0..=180.0).contains(&fall.angle_low) || !(0.0..=180.0).contains(&fall.angle_high) {
            return Err(anyhow!("fall angle thresholds must be within 0..=180 degrees"));
        }
        if fall.angle_low >= fall.angle_high {
            return Err(anyhow!(
                "fall_angle_low ({}) must be below fall_angle_high ({})",
                fall.angle_low,
                fall.angle_high
            ));
        }
        if let Some(interval) = self.sampling.interval {
            if interval.is_zero() {
                return Err(anyhow!("sampling interval must be greater than zero"));
            }
        }
        if self.sampling.default_stride == 0 {
            return Err(anyhow!("sampling.default_stride must be at least 1"));
        }
        if !(self.source.stub_fps.is_finite() && self.source.stub_fps > 0.0) {
            return Err(anyhow!("source.stub_fps must be greater than zero"));
        }
        Ok(())
    }

    /// Sampling policy for a pipeline of `kind`, with configured overrides
    /// applied on top of the kind's preset.
    pub fn sampling_policy(&self, kind: DetectionKind) -> SamplingPolicy {
        let interval = self.sampling.interval.unwrap_or_else(|| kind.default_interval());
        let policy = self.sampling.policy.unwrap_or(match kind.default_policy() {
            SamplingPolicy::TimeGated { .. } => PolicyKind::Time,
            SamplingPolicy::FrameStride { .. } => PolicyKind::Frames,
        });
        match policy {
            PolicyKind::Time => SamplingPolicy::time_gated(interval),
            PolicyKind::Frames => SamplingPolicy::FrameStride {
                interval,
                default_stride: self.sampling.default_stride,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_confidence: self.detector.min_confidence,
            read_retry: self.source.read_retry,
            max_read_failures: self.source.max_read_failures,
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            stub_fps: self.source.stub_fps,
            ..SourceSettings::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn secs_f64(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid duration: {} seconds", secs))
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}
