//! Alert dispatch.
//!
//! A fired decision becomes one snapshot on disk plus one multipart POST to
//! the pipeline's callback URL. Dispatch is attempted exactly once and never
//! fails the caller: every problem is folded into the returned [`Alert`].

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::frame::Frame;
use crate::rules::AlertContent;

/// Name of the multipart file part carrying the snapshot.
pub const IMAGE_FIELD: &str = "image";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent { status: u16 },
    Failed { status: Option<u16>, reason: String },
}

impl DispatchStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchStatus::Sent { .. })
    }
}

/// Immutable record of one dispatch attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub label: String,
    pub confidence: f32,
    pub timestamp: String,
    pub key: String,
    /// `None` when the snapshot could not be written.
    pub snapshot_path: Option<PathBuf>,
    pub fields: Vec<(String, String)>,
    pub status: DispatchStatus,
}

impl Alert {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// File part of a multipart form.
#[derive(Clone, Debug)]
pub struct FilePart {
    pub name: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// `multipart/form-data` body: text fields followed by at most one file.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

impl MultipartForm {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.file = Some(FilePart {
            name: name.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
        });
        self
    }

    pub fn encode(&self, boundary: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in &self.fields {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            );
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        if let Some(file) = &self.file {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    file.name, file.filename, file.content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(&file.bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        body
    }
}

/// Delivers an encoded alert. Returns the HTTP status of the response, any
/// status; `Err` only for transport failures.
pub trait AlertTransport: Send {
    fn post(&self, url: &str, form: &MultipartForm) -> Result<u16>;
}

pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl AlertTransport for HttpTransport {
    fn post(&self, url: &str, form: &MultipartForm) -> Result<u16> {
        let boundary = format!("sentinel-{:016x}", rand::random::<u64>());
        let body = form.encode(&boundary);
        let content_type = format!("multipart/form-data; boundary={}", boundary);
        match self
            .agent
            .post(url)
            .set("Content-Type", &content_type)
            .send_bytes(&body)
        {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(err) => Err(anyhow!("post to {}: {}", url, err)),
        }
    }
}

/// In-process transport that records every posted form and answers with a
/// fixed status, or fails every post.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    posted: Arc<Mutex<Vec<(String, MultipartForm)>>>,
    reply: std::result::Result<u16, String>,
}

impl MemoryTransport {
    pub fn new(status: u16) -> Self {
        Self {
            posted: Arc::new(Mutex::new(Vec::new())),
            reply: Ok(status),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            posted: Arc::new(Mutex::new(Vec::new())),
            reply: Err(reason.into()),
        }
    }

    /// `(url, form)` for every post attempted so far, failed ones included.
    pub fn posted(&self) -> Vec<(String, MultipartForm)> {
        self.posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AlertTransport for MemoryTransport {
    fn post(&self, url: &str, form: &MultipartForm) -> Result<u16> {
        self.posted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((url.to_string(), form.clone()));
        self.reply.clone().map_err(|reason| anyhow!(reason))
    }
}

/// Snapshot file name for an alert: `{label}_{key}_{timestamp}.jpg`, with the
/// key omitted when empty. `:` becomes `-`, spaces become `_`, and anything
/// else outside `[A-Za-z0-9._-]` is replaced by `_`.
pub fn snapshot_filename(label: &str, key: &str, timestamp: &str) -> String {
    let stem = if key.is_empty() {
        format!("{}_{}", label, timestamp)
    } else {
        format!("{}_{}_{}", label, key, timestamp)
    };
    let stem = stem.replace(':', "-").replace(' ', "_");
    format!("{}.jpg", sanitize(&stem))
}

fn sanitize(value: &str) -> String {
    static UNSAFE_RE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap());
    re.replace_all(value, "_").into_owned()
}

pub struct AlertDispatcher {
    snapshot_dir: PathBuf,
    callback_url: String,
    transport: Box<dyn AlertTransport>,
}

impl AlertDispatcher {
    pub fn new(
        snapshot_dir: impl Into<PathBuf>,
        callback_url: impl Into<String>,
        transport: Box<dyn AlertTransport>,
    ) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            callback_url: callback_url.into(),
            transport,
        }
    }

    pub fn http(
        snapshot_dir: impl Into<PathBuf>,
        callback_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::new(snapshot_dir, callback_url, Box::new(HttpTransport::new(timeout)))
    }

    /// Persist `frame` and POST it with the alert metadata. Overlays must
    /// already be burned into `frame`.
    pub fn dispatch(&self, content: &AlertContent, timestamp: &str, frame: &Frame) -> Alert {
        let mut alert = Alert {
            label: content.label.clone(),
            confidence: content.confidence,
            timestamp: timestamp.to_string(),
            key: content.key.clone(),
            snapshot_path: None,
            fields: content.fields.clone(),
            status: DispatchStatus::Failed {
                status: None,
                reason: String::new(),
            },
        };

        let filename = snapshot_filename(&content.label, &content.key, timestamp);
        let jpeg = match self.write_snapshot(&filename, frame) {
            Ok((path, jpeg)) => {
                alert.snapshot_path = Some(path);
                jpeg
            }
            Err(err) => {
                log::warn!("alert {}: snapshot not saved: {:#}", content.label, err);
                alert.status = DispatchStatus::Failed {
                    status: None,
                    reason: format!("snapshot: {:#}", err),
                };
                return alert;
            }
        };

        let mut form = MultipartForm::default()
            .text("label", content.label.as_str())
            .text("confidence", content.confidence.to_string())
            .text("timestamp", timestamp);
        for (name, value) in &content.fields {
            form = form.text(name.as_str(), value.as_str());
        }
        let form = form.file(IMAGE_FIELD, filename, "image/jpeg", jpeg);

        alert.status = match self.transport.post(&self.callback_url, &form) {
            Ok(status) if (200..300).contains(&status) => {
                log::info!(
                    "alert {} ({}) sent to {}: {}",
                    content.label,
                    content.key,
                    self.callback_url,
                    status
                );
                DispatchStatus::Sent { status }
            }
            Ok(status) => {
                log::warn!(
                    "alert {} ({}) rejected by {}: {}",
                    content.label,
                    content.key,
                    self.callback_url,
                    status
                );
                DispatchStatus::Failed {
                    status: Some(status),
                    reason: format!("callback returned {}", status),
                }
            }
            Err(err) => {
                log::warn!("alert {} ({}) not sent: {:#}", content.label, content.key, err);
                DispatchStatus::Failed {
                    status: None,
                    reason: format!("{:#}", err),
                }
            }
        };
        alert
    }

    fn write_snapshot(&self, filename: &str, frame: &Frame) -> Result<(PathBuf, Vec<u8>)> {
        fs::create_dir_all(&self.snapshot_dir)
            .with_context(|| format!("create {}", self.snapshot_dir.display()))?;
        let jpeg = frame.to_jpeg()?;
        let path = self.snapshot_dir.join(filename);
        fs::write(&path, &jpeg).with_context(|| format!("write {}", path.display()))?;
        Ok((path, jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{read_request, write_json};
    use std::net::TcpListener;

    fn plate_content() -> AlertContent {
        AlertContent {
            label: "plate_detected".to_string(),
            confidence: 0.87,
            key: "ABC123".to_string(),
            fields: vec![("plate".to_string(), "ABC123".to_string())],
        }
    }

    #[test]
    fn filename_has_no_colons_or_spaces() {
        let name = snapshot_filename("plate_detected", "AB 12/3", "2024-05-01 10:20:30");
        assert_eq!(name, "plate_detected_AB_12_3_2024-05-01_10-20-30.jpg");
        assert!(!name.contains(':'));
        assert!(!name.contains(' '));
        assert!(!name.contains('/'));
        assert_eq!(
            snapshot_filename("fall_detected", "", "2024-05-01 10:20:30"),
            "fall_detected_2024-05-01_10-20-30.jpg"
        );
        assert_eq!(
            snapshot_filename("plate_detected", "ÖL\\9?", "t"),
            "plate_detected__L_9__t.jpg"
        );
    }

    #[test]
    fn transport_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = AlertDispatcher::new(
            dir.path(),
            "http://127.0.0.1:1/alert",
            Box::new(MemoryTransport::failing("connection refused")),
        );
        let alert = dispatcher.dispatch(&plate_content(), "2024-05-01 10:20:30", &Frame::filled(8, 8, [0, 0, 0]));
        match &alert.status {
            DispatchStatus::Failed { status, reason } => {
                assert!(status.is_none());
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        // Snapshot is kept even though delivery failed.
        let path = alert.snapshot_path.expect("snapshot written");
        assert!(path.exists());
    }

    #[test]
    fn creates_snapshot_dir_and_posts_fields() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("nested").join("snapshots");
        let transport = MemoryTransport::new(201);
        let dispatcher =
            AlertDispatcher::new(&snapshots, "http://sink/alert", Box::new(transport.clone()));
        let alert = dispatcher.dispatch(&plate_content(), "2024-05-01 10:20:30", &Frame::filled(8, 8, [9, 9, 9]));

        assert_eq!(alert.status, DispatchStatus::Sent { status: 201 });
        assert_eq!(alert.field("plate"), Some("ABC123"));
        let path = alert.snapshot_path.unwrap();
        assert_eq!(path.parent(), Some(snapshots.as_path()));

        let posted = transport.posted();
        assert_eq!(posted.len(), 1);
        let (url, form) = &posted[0];
        assert_eq!(url, "http://sink/alert");
        let names: Vec<&str> = form.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["label", "confidence", "timestamp", "plate"]);
        let file = form.file.as_ref().unwrap();
        assert_eq!(file.name, "image");
        assert_eq!(&file.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unwritable_snapshot_dir_skips_post() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let transport = MemoryTransport::new(200);
        let dispatcher =
            AlertDispatcher::new(blocker.join("snaps"), "http://sink/alert", Box::new(transport.clone()));
        let alert = dispatcher.dispatch(&plate_content(), "2024-05-01 10:20:30", &Frame::filled(4, 4, [0, 0, 0]));
        assert!(!alert.status.is_sent());
        assert!(alert.snapshot_path.is_none());
        assert!(transport.posted().is_empty());
    }

    #[test]
    fn posts_multipart_to_local_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/alert", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream, 1 << 20).unwrap();
            write_json(&mut stream, 200, &serde_json::json!({"status": "ok"})).unwrap();
            request
        });

        let dir = tempfile::tempdir().unwrap();
        let dispatcher = AlertDispatcher::http(dir.path(), url, Duration::from_secs(5));
        let alert = dispatcher.dispatch(&plate_content(), "2024-05-01 10:20:30", &Frame::filled(8, 8, [1, 2, 3]));
        assert_eq!(alert.status, DispatchStatus::Sent { status: 200 });

        let request = server.join().unwrap();
        assert_eq!(request.method, "POST");
        assert!(request
            .header("content-type")
            .unwrap()
            .starts_with("multipart/form-data; boundary="));
        let body = String::from_utf8_lossy(&request.body);
        assert!(body.contains("name=\"label\"\r\n\r\nplate_detected\r\n"));
        assert!(body.contains("name=\"timestamp\"\r\n\r\n2024-05-01 10:20:30\r\n"));
        assert!(body.contains("name=\"plate\"\r\n\r\nABC123\r\n"));
        assert!(body.contains("name=\"image\"; filename=\"plate_detected_ABC123_2024-05-01_10-20-30.jpg\""));
    }

    #[test]
    fn error_status_is_failed_with_code() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/alert", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_request(&mut stream, 1 << 20).unwrap();
            write_json(&mut stream, 500, &serde_json::json!({"error": "boom"})).unwrap();
        });
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = AlertDispatcher::http(dir.path(), url, Duration::from_secs(5));
        let alert = dispatcher.dispatch(&plate_content(), "2024-05-01 10:20:30", &Frame::filled(8, 8, [1, 2, 3]));
        server.join().unwrap();
        match alert.status {
            DispatchStatus::Failed { status, .. } => assert_eq!(status, Some(500)),
            other => panic!("unexpected status {:?}", other),
        }
    }
}
