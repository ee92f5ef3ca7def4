//! Alert receiver service.
//!
//! The other end of the alert callback: accepts the dispatcher's multipart
//! POST, stores the snapshot, keeps the record in memory, and shows what it
//! got as JSON (`/alerts`) and as an HTML gallery (`/`). Snapshots are served
//! back from `/snapshots/<file>`.

pub mod multipart;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::dispatch::{snapshot_filename, IMAGE_FIELD};
use crate::http::{read_request, write_json, write_response, HttpRequest};

const MAX_ALERT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    pub addr: String,
    pub snapshot_dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            snapshot_dir: PathBuf::from("received"),
        }
    }
}

/// One received alert.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertRecord {
    pub label: String,
    pub confidence: f32,
    pub timestamp: String,
    pub plate: Option<String>,
    pub frame_number: Option<String>,
    pub angle: Option<String>,
    pub image_path: PathBuf,
    pub image_url: String,
}

/// Append-only in-memory list of received alerts.
#[derive(Debug, Default)]
pub struct AlertStore {
    records: Mutex<Vec<AlertRecord>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: AlertRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    /// Records in arrival order.
    pub fn all(&self) -> Vec<AlertRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ReceiverHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("receiver thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ReceiverServer {
    cfg: ReceiverConfig,
    store: Arc<AlertStore>,
}

impl ReceiverServer {
    pub fn new(cfg: ReceiverConfig, store: Arc<AlertStore>) -> Self {
        Self { cfg, store }
    }

    pub fn spawn(self) -> Result<ReceiverHandle> {
        std::fs::create_dir_all(&self.cfg.snapshot_dir)
            .with_context(|| format!("create {}", self.cfg.snapshot_dir.display()))?;
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let snapshot_dir = self.cfg.snapshot_dir.clone();
        let store = self.store.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_receiver(listener, &snapshot_dir, &store, shutdown_thread) {
                log::error!("alert receiver stopped: {}", err);
            }
        });
        log::info!("alert receiver listening on {}", addr);

        Ok(ReceiverHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_receiver(
    listener: TcpListener,
    snapshot_dir: &Path,
    store: &AlertStore,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, snapshot_dir, store) {
                    log::warn!("alert receiver request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, snapshot_dir: &Path, store: &AlertStore) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let request = read_request(&mut stream, MAX_ALERT_BYTES)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/alert") => match receive_alert(&request, snapshot_dir) {
            Ok(record) => {
                log::info!(
                    "alert received: {} at {} ({})",
                    record.label,
                    record.timestamp,
                    record.image_url
                );
                store.push(record);
                write_json(&mut stream, 200, &json!({"status": "ok"}))
            }
            Err(err) => {
                write_json(&mut stream, 400, &json!({"error": format!("{:#}", err)}))?;
                Err(err)
            }
        },
        ("GET", "/alerts") => write_json(&mut stream, 200, &json!({"alerts": store.all()})),
        ("GET", "/") => {
            let page = render_gallery(&store.all());
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        ("GET", path) if path.starts_with("/snapshots/") => {
            let name = &path["/snapshots/".len()..];
            match snapshot_path(snapshot_dir, name) {
                Some(file) if file.is_file() => {
                    let bytes = std::fs::read(&file)?;
                    write_response(&mut stream, 200, "image/jpeg", &bytes)
                }
                _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
            }
        }
        (_, "/alert") | (_, "/alerts") | (_, "/") => {
            write_json(&mut stream, 405, &json!({"error": "method_not_allowed"}))
        }
        _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn receive_alert(request: &HttpRequest, snapshot_dir: &Path) -> Result<AlertRecord> {
    let content_type = request
        .header("content-type")
        .ok_or_else(|| anyhow!("missing content type"))?;
    let boundary =
        multipart::boundary(content_type).ok_or_else(|| anyhow!("expected multipart/form-data"))?;
    let parts = multipart::parse(&request.body, &boundary)?;

    let text = |name: &str| -> Option<String> {
        parts
            .iter()
            .find(|part| part.name == name && part.filename.is_none())
            .and_then(|part| part.text())
            .map(|value| value.trim().to_string())
    };
    let required = |name: &str| -> Result<String> {
        text(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("missing field '{}'", name))
    };

    let label = required("label")?;
    let confidence: f32 = required("confidence")?
        .parse()
        .map_err(|_| anyhow!("confidence must be a number"))?;
    let timestamp = required("timestamp")?;
    let image = parts
        .iter()
        .find(|part| part.name == IMAGE_FIELD && !part.data.is_empty())
        .ok_or_else(|| anyhow!("missing field '{}'", IMAGE_FIELD))?;
    let plate = text("plate").filter(|value| !value.is_empty());
    let frame_number = text("frame_number").filter(|value| !value.is_empty());
    let angle = text("angle").filter(|value| !value.is_empty());

    let key = match (&plate, &frame_number) {
        (Some(plate), _) => plate.clone(),
        (None, Some(frame)) => format!("frame{}", frame),
        (None, None) => String::new(),
    };
    let filename = snapshot_filename(&label, &key, &timestamp);
    let image_path = snapshot_dir.join(&filename);
    std::fs::write(&image_path, &image.data)
        .with_context(|| format!("write {}", image_path.display()))?;

    Ok(AlertRecord {
        label,
        confidence,
        timestamp,
        plate,
        frame_number,
        angle,
        image_path,
        image_url: format!("/snapshots/{}", filename),
    })
}

/// Resolve a request path segment to a file directly inside `dir`.
fn snapshot_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Some(dir.join(name))
    } else {
        None
    }
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Gallery page, newest alert first.
pub fn render_gallery(records: &[AlertRecord]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Alerts</title>\n<style>\n\
body { font-family: Arial, sans-serif; background: #f7f7f7; margin: 0; padding: 20px; }\n\
h2 { text-align: center; color: #c0392b; }\n\
.gallery { display: grid; grid-template-columns: repeat(auto-fit, minmax(250px, 1fr)); gap: 20px; }\n\
.card { background: white; border-radius: 12px; padding: 12px; box-shadow: 0 2px 8px rgba(0,0,0,0.1); text-align: center; }\n\
.card img { width: 100%; height: 180px; object-fit: cover; border-radius: 8px; }\n\
.meta { font-size: 14px; color: #333; }\n\
</style>\n</head>\n<body>\n",
    );
    html.push_str(&format!("<h2>Alerts ({})</h2>\n", records.len()));
    if records.is_empty() {
        html.push_str("<p>No alerts received yet.</p>\n");
    }
    html.push_str("<div class=\"gallery\">\n");
    for record in records.iter().rev() {
        html.push_str("<div class=\"card\">\n");
        html.push_str(&format!(
            "<img src=\"{}\" alt=\"snapshot\">\n<div class=\"meta\">\n<strong>{}</strong><br>\n",
            escape_html(&record.image_url),
            escape_html(&record.label)
        ));
        html.push_str(&format!("Confidence: {:.2}<br>\n", record.confidence));
        if let Some(plate) = &record.plate {
            html.push_str(&format!("Plate: {}<br>\n", escape_html(plate)));
        }
        if let Some(frame) = &record.frame_number {
            html.push_str(&format!("Frame: {}<br>\n", escape_html(frame)));
        }
        if let Some(angle) = &record.angle {
            html.push_str(&format!("Angle: {}<br>\n", escape_html(angle)));
        }
        html.push_str(&format!(
            "Time: {}\n</div>\n</div>\n",
            escape_html(&record.timestamp)
        ));
    }
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MultipartForm;
    use std::collections::HashMap;

    fn alert_request(form: &MultipartForm) -> HttpRequest {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "multipart/form-data; boundary=test-boundary".to_string(),
        );
        HttpRequest {
            method: "POST".to_string(),
            path: "/alert".to_string(),
            query: Vec::new(),
            headers,
            body: form.encode("test-boundary"),
        }
    }

    fn record(label: &str, timestamp: &str) -> AlertRecord {
        AlertRecord {
            label: label.to_string(),
            confidence: 0.9,
            timestamp: timestamp.to_string(),
            plate: None,
            frame_number: None,
            angle: None,
            image_path: PathBuf::from("x.jpg"),
            image_url: "/snapshots/x.jpg".to_string(),
        }
    }

    #[test]
    fn stores_image_under_deterministic_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let form = MultipartForm::default()
            .text("label", "plate_detected")
            .text("confidence", "0.87")
            .text("timestamp", "2024-05-01 10:20:30")
            .text("plate", "ABC123")
            .file("image", "upload.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF, 0xD9]);
        let record = receive_alert(&alert_request(&form), dir.path())?;
        assert_eq!(record.plate.as_deref(), Some("ABC123"));
        assert!((record.confidence - 0.87).abs() < 1e-6);
        assert_eq!(
            record.image_url,
            "/snapshots/plate_detected_ABC123_2024-05-01_10-20-30.jpg"
        );
        assert_eq!(std::fs::read(&record.image_path)?, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        Ok(())
    }

    #[test]
    fn fall_alert_is_keyed_by_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let form = MultipartForm::default()
            .text("label", "fall_detected")
            .text("confidence", "1")
            .text("timestamp", "2024-05-01 10:20:30")
            .text("frame_number", "12")
            .text("angle", "{\"0\":20.0}")
            .file("image", "upload.jpg", "image/jpeg", vec![1, 2, 3]);
        let record = receive_alert(&alert_request(&form), dir.path())?;
        assert_eq!(record.angle.as_deref(), Some("{\"0\":20.0}"));
        assert!(record.image_url.ends_with("fall_detected_frame12_2024-05-01_10-20-30.jpg"));
        Ok(())
    }

    #[test]
    fn missing_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let no_image = MultipartForm::default()
            .text("label", "plate_detected")
            .text("confidence", "0.8")
            .text("timestamp", "2024-05-01 10:20:30");
        let err = receive_alert(&alert_request(&no_image), dir.path()).unwrap_err();
        assert!(err.to_string().contains("image"));

        let no_label = MultipartForm::default()
            .text("confidence", "0.8")
            .text("timestamp", "2024-05-01 10:20:30")
            .file("image", "a.jpg", "image/jpeg", vec![1]);
        let err = receive_alert(&alert_request(&no_label), dir.path()).unwrap_err();
        assert!(err.to_string().contains("label"));

        let bad_conf = MultipartForm::default()
            .text("label", "x")
            .text("confidence", "high")
            .text("timestamp", "t")
            .file("image", "a.jpg", "image/jpeg", vec![1]);
        assert!(receive_alert(&alert_request(&bad_conf), dir.path()).is_err());
    }

    #[test]
    fn snapshot_paths_stay_inside_dir() {
        let dir = Path::new("/srv/snapshots");
        assert_eq!(
            snapshot_path(dir, "plate_ABC_2024-01-01_10-00-00.jpg"),
            Some(dir.join("plate_ABC_2024-01-01_10-00-00.jpg"))
        );
        assert!(snapshot_path(dir, "../etc/passwd").is_none());
        assert!(snapshot_path(dir, "..").is_none());
        assert!(snapshot_path(dir, "a/b.jpg").is_none());
        assert!(snapshot_path(dir, "").is_none());
    }

    #[test]
    fn gallery_is_newest_first_and_escaped() {
        let mut evil = record("<script>alert(1)</script>", "2024-05-01 10:00:02");
        evil.plate = Some("A&B".to_string());
        let page = render_gallery(&[record("first", "2024-05-01 10:00:01"), evil]);
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("Plate: A&amp;B"));
        let newest = page.find("10:00:02").unwrap();
        let oldest = page.find("10:00:01").unwrap();
        assert!(newest < oldest);
    }

    #[test]
    fn store_keeps_arrival_order() {
        let store = AlertStore::new();
        assert!(store.is_empty());
        store.push(record("a", "1"));
        store.push(record("b", "2"));
        let labels: Vec<String> = store.all().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }
}
