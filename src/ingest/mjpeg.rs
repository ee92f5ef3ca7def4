//! HTTP frame source.
//!
//! Handles the two shapes network cameras expose over HTTP:
//! - `multipart/x-mixed-replace` MJPEG streams, split on JPEG SOI/EOI markers
//! - single-JPEG snapshot endpoints, fetched once per read
//!
//! A broken MJPEG connection surfaces as `ReadFailed`; the next read
//! reconnects, so a pipeline that backs off and retries rides out hiccups.

use std::io::{ErrorKind, Read};
use std::time::Instant;

use super::{FrameSource, ReadOutcome, SourceSettings, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegSource {
    uri: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
    last_read_at: Option<Instant>,
    open: bool,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    /// Connect to `uri`. A failed initial connection is terminal.
    pub fn open(uri: &str, settings: &SourceSettings) -> Result<Self, SourceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        let mut source = Self {
            uri: uri.to_string(),
            agent,
            stream: None,
            frame_count: 0,
            last_read_at: None,
            open: true,
        };
        source
            .connect()
            .map_err(|e| SourceError::Unavailable(format!("connect to {}: {}", uri, e)))?;
        log::info!("MjpegSource: connected to {}", uri);
        Ok(source)
    }

    fn connect(&mut self) -> Result<(), ureq::Error> {
        let response = self.agent.get(&self.uri).call()?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(Box::new(response.into_reader())))
        } else {
            HttpStream::SingleJpeg
        });
        Ok(())
    }

    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if !self.open {
            return Err(SourceError::ReadFailed("source closed".to_string()));
        }
        if self.stream.is_none() {
            self.connect()
                .map_err(|e| SourceError::ReadFailed(format!("reconnect: {}", e)))?;
            log::info!("MjpegSource: reconnected to {}", self.uri);
        }
        let result = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => fetch_single_jpeg(&self.agent, &self.uri).map(Some),
            None => Err(SourceError::ReadFailed("not connected".to_string())),
        };
        if let Err(SourceError::ReadFailed(_)) = &result {
            // Drop the connection; the next read reconnects.
            self.stream = None;
        }
        result
    }
}

impl FrameSource for MjpegSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        let Some(jpeg) = self.next_jpeg()? else {
            return Ok(ReadOutcome::EndOfStream);
        };
        let frame = Frame::from_jpeg(&jpeg).map_err(|e| SourceError::ReadFailed(e.to_string()))?;
        self.frame_count += 1;
        self.last_read_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(frame))
    }

    fn grab(&mut self) -> Result<bool, SourceError> {
        // Skip the JPEG decode for discarded frames.
        let grabbed = self.next_jpeg()?.is_some();
        if grabbed {
            self.frame_count += 1;
            self.last_read_at = Some(Instant::now());
        }
        Ok(grabbed)
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
            log::info!("MjpegSource: closed {}", self.uri);
        }
        self.stream = None;
        self.open = false;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` once the server closes the stream.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SourceError::ReadFailed(format!("read mjpeg chunk: {}", e))),
            };
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, SourceError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| SourceError::ReadFailed(format!("fetch jpeg snapshot from {}: {}", url, e)))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| SourceError::ReadFailed(format!("read jpeg snapshot: {}", e)))?;
    if bytes.is_empty() {
        return Err(SourceError::ReadFailed("empty jpeg snapshot".to_string()));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;

    #[test]
    fn finds_jpeg_between_boundaries() {
        let data = b"--frame\r\n\r\n\xFF\xD8abc\xFF\xD9--frame";
        let (start, end) = find_jpeg_bounds(data).unwrap();
        assert_eq!(&data[start..end], b"\xFF\xD8abc\xFF\xD9");
    }

    #[test]
    fn incomplete_jpeg_has_no_bounds() {
        assert!(find_jpeg_bounds(b"\xFF\xD8abc").is_none());
        assert!(find_jpeg_bounds(b"no markers").is_none());
    }

    #[test]
    fn mjpeg_stream_splits_frames_and_reports_end() {
        let body = b"--b\r\n\xFF\xD8one\xFF\xD9\r\n--b\r\n\xFF\xD8two\xFF\xD9\r\n".to_vec();
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        assert_eq!(stream.read_next_jpeg().unwrap().unwrap(), b"\xFF\xD8one\xFF\xD9");
        assert_eq!(stream.read_next_jpeg().unwrap().unwrap(), b"\xFF\xD8two\xFF\xD9");
        assert!(stream.read_next_jpeg().unwrap().is_none());
    }

    #[test]
    fn unreachable_endpoint_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = MjpegSource::open(&format!("http://{}/stream", addr), &SourceSettings::default())
            .err();
        assert!(matches!(err, Some(SourceError::Unavailable(_))));
    }

    #[test]
    fn reads_frames_from_mjpeg_server() -> anyhow::Result<()> {
        let jpeg = Frame::filled(8, 8, [10, 20, 30]).to_jpeg()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = std::io::Read::read(&mut stream, &mut buf);
            let mut response = Vec::new();
            response.extend_from_slice(
                b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n",
            );
            for _ in 0..2 {
                response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
                response.extend_from_slice(&jpeg);
                response.extend_from_slice(b"\r\n");
            }
            stream.write_all(&response).unwrap();
        });

        let mut source = MjpegSource::open(&format!("http://{}/stream", addr), &SourceSettings::default())?;
        match source.read()? {
            ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (8, 8)),
            ReadOutcome::EndOfStream => panic!("expected a frame"),
        }
        assert!(source.grab()?);
        server.join().unwrap();
        assert!(matches!(source.read()?, ReadOutcome::EndOfStream));
        assert_eq!(source.stats().frames_read, 2);
        source.close();
        assert!(!source.stats().open);
        Ok(())
    }
}
