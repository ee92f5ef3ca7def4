//! Stream supervisor.
//!
//! Owns the registration map of running pipelines: one OS thread per stream,
//! each with its own [`CancelToken`]. `start` returns as soon as the thread is
//! spawned; the pipeline is built (source opened, detector configured) on that
//! thread so a slow camera never blocks the caller.
//!
//! Per-pipeline state machine:
//!
//! ```text
//! Requested -> Running -> Stopping -> Stopped
//!     \____________________________/
//!        (source unavailable / build failure)
//! ```
//!
//! Pipelines share nothing but this map. In particular each plate pipeline
//! has its own dedup state, even when two of them watch the same camera.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::audit::AuditLog;
use crate::clock::{CancelToken, Clock, SystemClock};
use crate::config::SentinelConfig;
use crate::detect::{HttpBackend, HttpBackendConfig};
use crate::dispatch::AlertDispatcher;
use crate::ingest::open_source;
use crate::pipeline::{DetectionKind, Pipeline, PipelineReport};
use crate::rules::{DecisionRule, FallAngleRule, PlateDedupRule};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Requested,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartRequest {
    pub source_uri: String,
    pub callback_url: String,
    pub kind: DetectionKind,
}

/// What `stop` applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopTarget {
    One(PipelineId),
    All,
}

/// Listing entry for one registered pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineInfo {
    pub id: PipelineId,
    pub source_uri: String,
    pub callback_url: String,
    pub kind: DetectionKind,
    pub state: PipelineState,
    /// Why a pipeline stopped on its own, if it did.
    pub error: Option<String>,
}

/// Builds a ready-to-run pipeline for a start request. Called on the
/// pipeline's own thread.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, request: &StartRequest) -> Result<Pipeline>;
}

/// Production factory: sources by URI scheme, remote HTTP detector, HTTP
/// alert delivery, all configured from [`SentinelConfig`].
pub struct DefaultFactory {
    config: SentinelConfig,
    clock: Arc<dyn Clock>,
}

impl DefaultFactory {
    pub fn new(config: SentinelConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl PipelineFactory for DefaultFactory {
    fn build(&self, request: &StartRequest) -> Result<Pipeline> {
        let cfg = &self.config;
        let detector_url = cfg
            .detector
            .url
            .clone()
            .ok_or_else(|| anyhow!("no detector url configured (SENTINEL_DETECTOR_URL)"))?;
        let source = open_source(&request.source_uri, &cfg.source_settings())?;
        let detector = HttpBackend::new(HttpBackendConfig {
            url: detector_url,
            timeout: cfg.detector.timeout,
        });
        let rule: Box<dyn DecisionRule> = match request.kind {
            DetectionKind::Plate => Box::new(PlateDedupRule::new(cfg.rules.duplicate_timeout)),
            DetectionKind::Fall => Box::new(FallAngleRule::new(cfg.rules.fall)),
        };
        let dispatcher = AlertDispatcher::http(
            &cfg.snapshot_dir,
            request.callback_url.clone(),
            cfg.dispatch_timeout,
        );
        let mut pipeline = Pipeline::new(
            source,
            cfg.sampling_policy(request.kind),
            Box::new(detector),
            rule,
            dispatcher,
            self.clock.clone(),
        )
        .with_settings(cfg.pipeline_settings());
        if request.kind.writes_audit_log() {
            pipeline = pipeline.with_audit(AuditLog::open(&cfg.audit_log)?);
        }
        Ok(pipeline)
    }
}

struct Registration {
    info: PipelineInfo,
    status: Arc<Mutex<Status>>,
    cancel: CancelToken,
    join: Option<JoinHandle<Option<PipelineReport>>>,
}

struct Status {
    state: PipelineState,
    error: Option<String>,
}

/// A stopped pipeline's thread. Dropping it detaches the thread, which
/// still exits on its own once it observes the cancellation.
pub struct PipelineHandle {
    pub id: PipelineId,
    join: Option<JoinHandle<Option<PipelineReport>>>,
}

impl PipelineHandle {
    /// Wait for the pipeline thread to finish. `None` if the pipeline never
    /// started or its thread panicked.
    pub fn wait(mut self) -> Option<PipelineReport> {
        let join = self.join.take()?;
        match join.join() {
            Ok(report) => report,
            Err(_) => {
                log::error!("pipeline {}: thread panicked", self.id);
                None
            }
        }
    }
}

pub struct Supervisor {
    factory: Arc<dyn PipelineFactory>,
    next_id: AtomicU64,
    pipelines: Mutex<HashMap<PipelineId, Registration>>,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Self {
        Self {
            factory,
            next_id: AtomicU64::new(1),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Register and spawn a pipeline. Does not wait for the source to open.
    pub fn start(&self, request: StartRequest) -> Result<PipelineId> {
        let id = PipelineId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancelToken::new();
        let status = Arc::new(Mutex::new(Status {
            state: PipelineState::Requested,
            error: None,
        }));

        let factory = self.factory.clone();
        let thread_cancel = cancel.clone();
        let thread_status = status.clone();
        let thread_request = request.clone();
        let join = std::thread::Builder::new()
            .name(format!("pipeline-{}", id))
            .spawn(move || run_pipeline(id, factory, thread_request, thread_cancel, thread_status))
            .with_context(|| format!("spawn pipeline {}", id))?;

        log::info!(
            "pipeline {}: requested {} for {} -> {}",
            id,
            request.kind,
            request.source_uri,
            request.callback_url
        );
        self.registry().insert(
            id,
            Registration {
                info: PipelineInfo {
                    id,
                    source_uri: request.source_uri,
                    callback_url: request.callback_url,
                    kind: request.kind,
                    state: PipelineState::Requested,
                    error: None,
                },
                status,
                cancel,
                join: Some(join),
            },
        );
        Ok(id)
    }

    /// Raise cancellation for the targeted pipelines and unregister them.
    /// Unknown ids and repeated calls are no-ops.
    pub fn stop(&self, target: StopTarget) -> Vec<PipelineHandle> {
        let removed: Vec<Registration> = {
            let mut registry = self.registry();
            match target {
                StopTarget::One(id) => registry.remove(&id).into_iter().collect(),
                StopTarget::All => registry.drain().map(|(_, reg)| reg).collect(),
            }
        };
        removed
            .into_iter()
            .map(|mut reg| {
                {
                    let mut status = lock(&reg.status);
                    if status.state != PipelineState::Stopped {
                        status.state = PipelineState::Stopping;
                    }
                }
                reg.cancel.cancel();
                log::info!("pipeline {}: stop requested", reg.info.id);
                PipelineHandle {
                    id: reg.info.id,
                    join: reg.join.take(),
                }
            })
            .collect()
    }

    /// Stop everything and wait for every thread to exit.
    pub fn shutdown(&self) -> Vec<PipelineReport> {
        self.stop(StopTarget::All)
            .into_iter()
            .filter_map(PipelineHandle::wait)
            .collect()
    }

    pub fn list(&self) -> Vec<PipelineInfo> {
        let registry = self.registry();
        let mut infos: Vec<PipelineInfo> = registry.values().map(Registration::snapshot).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn state(&self, id: PipelineId) -> Option<PipelineState> {
        self.registry().get(&id).map(|reg| lock(&reg.status).state)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PipelineId, Registration>> {
        lock(&self.pipelines)
    }
}

impl Registration {
    fn snapshot(&self) -> PipelineInfo {
        let status = lock(&self.status);
        PipelineInfo {
            state: status.state,
            error: status.error.clone(),
            ..self.info.clone()
        }
    }
}

fn run_pipeline(
    id: PipelineId,
    factory: Arc<dyn PipelineFactory>,
    request: StartRequest,
    cancel: CancelToken,
    status: Arc<Mutex<Status>>,
) -> Option<PipelineReport> {
    let pipeline = match factory.build(&request) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            log::error!("pipeline {}: cannot start on {}: {:#}", id, request.source_uri, err);
            let mut status = lock(&status);
            status.state = PipelineState::Stopped;
            status.error = Some(format!("{:#}", err));
            return None;
        }
    };
    {
        let mut status = lock(&status);
        if status.state == PipelineState::Requested {
            status.state = PipelineState::Running;
        }
    }
    let report = pipeline.run(&cancel);
    let mut status = lock(&status);
    status.state = PipelineState::Stopped;
    status.error = match &report.end {
        crate::pipeline::EndReason::SourceUnavailable(reason)
        | crate::pipeline::EndReason::ReadFailures(reason) => Some(reason.clone()),
        _ => None,
    };
    Some(report)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detect::{Detection, ScriptedBackend};
    use crate::dispatch::MemoryTransport;
    use crate::error::SourceError;
    use crate::frame::Frame;
    use crate::ingest::ScriptedSource;
    use crate::pipeline::EndReason;
    use crate::sampler::SamplingPolicy;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    /// Endless scripted sources on the real clock; records each source's
    /// open flag so tests can check it is released.
    struct EndlessFactory {
        snapshot_dir: std::path::PathBuf,
        open_flags: Mutex<Vec<Arc<AtomicBool>>>,
        transport: MemoryTransport,
    }

    impl EndlessFactory {
        fn new(dir: &std::path::Path) -> Self {
            Self {
                snapshot_dir: dir.to_path_buf(),
                open_flags: Mutex::new(Vec::new()),
                transport: MemoryTransport::new(200),
            }
        }
    }

    impl PipelineFactory for EndlessFactory {
        fn build(&self, request: &StartRequest) -> Result<Pipeline> {
            if request.source_uri.starts_with("dead://") {
                return Err(SourceError::Unavailable("no route to camera".to_string()).into());
            }
            let source = ScriptedSource::new(request.source_uri.clone(), Vec::new())
                .repeating(Frame::filled(8, 8, [0, 0, 0]));
            self.open_flags.lock().unwrap().push(source.open_flag());
            let detector = ScriptedBackend::new(vec![Ok(vec![Detection::plate(
                request.source_uri.clone(),
                0.9,
            )])]);
            Ok(Pipeline::new(
                Box::new(source),
                SamplingPolicy::time_gated(Duration::from_millis(20)),
                Box::new(detector),
                Box::new(PlateDedupRule::default()),
                AlertDispatcher::new(
                    &self.snapshot_dir,
                    request.callback_url.clone(),
                    Box::new(self.transport.clone()),
                ),
                Arc::new(SystemClock::new()),
            ))
        }
    }

    fn request(uri: &str) -> StartRequest {
        StartRequest {
            source_uri: uri.to_string(),
            callback_url: "http://sink/alert".to_string(),
            kind: DetectionKind::Plate,
        }
    }

    fn wait_for_state(sup: &Supervisor, id: PipelineId, want: PipelineState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.state(id) != Some(want) {
            assert!(Instant::now() < deadline, "pipeline {} never reached {:?}", id, want);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn stop_mid_run_terminates_and_releases_source() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(EndlessFactory::new(dir.path()));
        let sup = Supervisor::new(factory.clone());
        let id = sup.start(request("test://cam-1")).unwrap();
        wait_for_state(&sup, id, PipelineState::Running);
        std::thread::sleep(Duration::from_millis(60));

        let started = Instant::now();
        let handles = sup.stop(StopTarget::One(id));
        assert_eq!(handles.len(), 1);
        let report = handles.into_iter().next().unwrap().wait().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.end, EndReason::Cancelled);
        assert!(report.samples >= 1);
        assert_eq!(report.alerts(), 1);

        let flags = factory.open_flags.lock().unwrap();
        assert!(flags.iter().all(|open| !open.load(Ordering::SeqCst)));
        assert!(sup.list().is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(Arc::new(EndlessFactory::new(dir.path())));
        let id = sup.start(request("test://cam-1")).unwrap();
        assert_eq!(sup.stop(StopTarget::One(id)).len(), 1);
        assert!(sup.stop(StopTarget::One(id)).is_empty());
        assert!(sup.stop(StopTarget::All).is_empty());
        assert!(sup.stop(StopTarget::One(PipelineId(999))).is_empty());
    }

    #[test]
    fn pipelines_run_independently() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(EndlessFactory::new(dir.path()));
        let sup = Supervisor::new(factory.clone());
        let a = sup.start(request("test://cam-a")).unwrap();
        let b = sup.start(request("test://cam-b")).unwrap();
        assert_ne!(a, b);
        wait_for_state(&sup, a, PipelineState::Running);
        wait_for_state(&sup, b, PipelineState::Running);

        // Stopping one leaves the other running.
        let report_a = sup
            .stop(StopTarget::One(a))
            .into_iter()
            .next()
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report_a.source_uri, "test://cam-a");
        assert_eq!(sup.state(b), Some(PipelineState::Running));
        let listed: Vec<PipelineId> = sup.list().iter().map(|info| info.id).collect();
        assert_eq!(listed, vec![b]);

        let reports = sup.shutdown();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].source_uri, "test://cam-b");
        assert!(factory
            .open_flags
            .lock()
            .unwrap()
            .iter()
            .all(|open| !open.load(Ordering::SeqCst)));
    }

    #[test]
    fn unavailable_source_ends_in_stopped_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(Arc::new(EndlessFactory::new(dir.path())));
        let id = sup.start(request("dead://cam")).unwrap();
        wait_for_state(&sup, id, PipelineState::Stopped);
        let info = sup.list().into_iter().find(|info| info.id == id).unwrap();
        assert!(info.error.unwrap().contains("no route to camera"));
        let handle = sup.stop(StopTarget::One(id)).into_iter().next().unwrap();
        assert!(handle.wait().is_none());
    }

    #[test]
    fn default_factory_requires_detector_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SentinelConfig::default();
        config.snapshot_dir = dir.path().join("snapshots");
        let factory = DefaultFactory::new(config).with_clock(Arc::new(ManualClock::new()));
        let err = factory.build(&request("stub://cam")).err().unwrap();
        assert!(format!("{:#}", err).contains("detector url"));
    }

    #[test]
    fn default_factory_rejects_unknown_scheme() {
        let mut config = SentinelConfig::default();
        config.detector.url = Some("http://127.0.0.1:1/detect".to_string());
        let factory = DefaultFactory::new(config);
        let err = factory.build(&request("gopher://cam")).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::Unavailable(_))
        ));
    }

    #[test]
    fn default_factory_opens_audit_log_for_falls() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SentinelConfig::default();
        config.detector.url = Some("http://127.0.0.1:1/detect".to_string());
        config.audit_log = dir.path().join("alerts.csv");
        let factory = DefaultFactory::new(config);
        let pipeline = factory
            .build(&StartRequest {
                source_uri: "stub://cam?frames=1".to_string(),
                callback_url: "http://sink/alert".to_string(),
                kind: DetectionKind::Fall,
            })
            .unwrap();
        assert_eq!(pipeline.source_uri(), "stub://cam?frames=1");
        assert!(dir.path().join("alerts.csv").exists());
    }
}
