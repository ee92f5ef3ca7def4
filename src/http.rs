//! Minimal HTTP/1.1 plumbing shared by the control API and the alert receiver.
//!
//! One request per connection, `Connection: close` on every response. Bodies
//! are read only up to `Content-Length` and capped by the caller.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};

const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of a decoded query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header lookup; names are stored lower-cased.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

/// Read one request (head and body) from `reader`.
pub fn read_request<R: Read>(reader: &mut R, max_body_bytes: usize) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request head too large"));
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of request head"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(anyhow!(
            "request body of {} bytes exceeds limit of {}",
            content_length,
            max_body_bytes
        ));
    }

    let mut body = data[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of request body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
    })
}

pub fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status = status,
        reason = reason_phrase(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

pub fn write_json<W: Write, T: Serialize>(stream: &mut W, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_query_and_headers() -> Result<()> {
        let raw = b"GET /process-stream?source_uri=rtsp%3A%2F%2Fcam%2F1&kind=fall HTTP/1.1\r\nHost: x\r\nX-Test: yes\r\n\r\n";
        let req = read_request(&mut Cursor::new(raw.to_vec()), 0)?;
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/process-stream");
        assert_eq!(req.query_param("source_uri"), Some("rtsp://cam/1"));
        assert_eq!(req.query_param("kind"), Some("fall"));
        assert_eq!(req.header("X-Test"), Some("yes"));
        assert!(req.body.is_empty());
        Ok(())
    }

    #[test]
    fn reads_body_up_to_content_length() -> Result<()> {
        let raw = b"POST /alert HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello trailing".to_vec();
        let req = read_request(&mut Cursor::new(raw), 1024)?;
        assert_eq!(req.body, b"hello");
        Ok(())
    }

    #[test]
    fn rejects_oversized_body() {
        let raw = b"POST /alert HTTP/1.1\r\nContent-Length: 5000\r\n\r\n".to_vec();
        assert!(read_request(&mut Cursor::new(raw), 1024).is_err());
    }

    #[test]
    fn rejects_truncated_body() {
        let raw = b"POST /alert HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc".to_vec();
        assert!(read_request(&mut Cursor::new(raw), 1024).is_err());
    }

    #[test]
    fn response_has_status_line_and_length() -> Result<()> {
        let mut out = Vec::new();
        write_response(&mut out, 404, "text/plain", b"nope")?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
        Ok(())
    }
}
