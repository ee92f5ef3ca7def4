use crate::http::{read_request, write_json, HttpRequest};
use crate::pipeline::DetectionKind;
use crate::supervisor::{PipelineId, StartRequest, StopTarget, Supervisor};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Kind used when `/process-stream` does not name one.
    pub default_kind: DetectionKind,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
            default_kind: DetectionKind::Plate,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Control API for the stream supervisor:
///
/// - `GET /process-stream?source_uri=..&callback_url=..[&kind=plate|fall]`
/// - `GET /stop-stream[?id=..]`
/// - `GET /pipelines`
/// - `GET /health`
pub struct ApiServer {
    cfg: ApiConfig,
    supervisor: Arc<Supervisor>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, supervisor: Arc<Supervisor>) -> Self {
        Self { cfg, supervisor }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let supervisor = self.supervisor.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, supervisor, shutdown_thread) {
                log::error!("control api stopped: {}", err);
            }
        });
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    supervisor: Arc<Supervisor>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg, &supervisor) {
                    log::warn!("control api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    supervisor: &Supervisor,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let request = read_request(&mut stream, MAX_BODY_BYTES)?;
    if request.method != "GET" {
        write_json(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json(&mut stream, 200, &json!({"status": "ok"})),
        "/process-stream" => match parse_start(&request, cfg.default_kind) {
            Ok(start) => {
                let id = supervisor.start(start)?;
                write_json(
                    &mut stream,
                    200,
                    &json!({"status": "started", "pipeline_id": id}),
                )
            }
            Err(err) => {
                write_json(&mut stream, 400, &json!({"error": err.to_string()}))?;
                Err(err)
            }
        },
        "/stop-stream" => {
            let target = match request.query_param("id") {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(id) => StopTarget::One(PipelineId(id)),
                    Err(_) => {
                        write_json(&mut stream, 400, &json!({"error": "invalid_id"}))?;
                        return Err(anyhow!("invalid pipeline id '{}'", raw));
                    }
                },
                None => StopTarget::All,
            };
            // Handles are dropped: pipelines finish on their own threads.
            let stopped: Vec<PipelineId> = supervisor
                .stop(target)
                .into_iter()
                .map(|handle| handle.id)
                .collect();
            write_json(
                &mut stream,
                200,
                &json!({"status": "stopped", "stopped": stopped}),
            )
        }
        "/pipelines" => write_json(&mut stream, 200, &json!({"pipelines": supervisor.list()})),
        _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn parse_start(request: &HttpRequest, default_kind: DetectionKind) -> Result<StartRequest> {
    let source_uri = request
        .query_param("source_uri")
        .or_else(|| request.query_param("http_url"))
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| anyhow!("missing source_uri"))?;
    let callback_url = request
        .query_param("callback_url")
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| anyhow!("missing callback_url"))?;
    url::Url::parse(callback_url).map_err(|e| anyhow!("invalid callback_url: {}", e))?;
    let kind = match request.query_param("kind") {
        Some(kind) => kind.parse()?,
        None => default_kind,
    };
    Ok(StartRequest {
        source_uri: source_uri.to_string(),
        callback_url: callback_url.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn get(path: &str) -> HttpRequest {
        let raw = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        read_request(&mut Cursor::new(raw.into_bytes()), 0).unwrap()
    }

    #[test]
    fn start_request_accepts_http_url_alias() -> Result<()> {
        let req = get("/process-stream?http_url=http%3A%2F%2Fcam%2Fvideo&callback_url=http%3A%2F%2Fsink%2Falert");
        let start = parse_start(&req, DetectionKind::Plate)?;
        assert_eq!(start.source_uri, "http://cam/video");
        assert_eq!(start.callback_url, "http://sink/alert");
        assert_eq!(start.kind, DetectionKind::Plate);
        Ok(())
    }

    #[test]
    fn start_request_kind_overrides_default() -> Result<()> {
        let req = get("/process-stream?source_uri=stub%3A%2F%2Fcam&callback_url=http%3A%2F%2Fsink&kind=fall");
        assert_eq!(parse_start(&req, DetectionKind::Plate)?.kind, DetectionKind::Fall);
        Ok(())
    }

    #[test]
    fn start_request_requires_both_urls() {
        assert!(parse_start(&get("/process-stream?callback_url=http%3A%2F%2Fsink"), DetectionKind::Plate).is_err());
        assert!(parse_start(&get("/process-stream?source_uri=stub%3A%2F%2Fcam"), DetectionKind::Plate).is_err());
        assert!(parse_start(
            &get("/process-stream?source_uri=stub%3A%2F%2Fcam&callback_url=not-a-url"),
            DetectionKind::Plate
        )
        .is_err());
        assert!(parse_start(
            &get("/process-stream?source_uri=stub%3A%2F%2Fcam&callback_url=http%3A%2F%2Fsink&kind=faces"),
            DetectionKind::Plate
        )
        .is_err());
    }
}
