//! Directory-of-JPEGs frame source (`file:///path/to/frames?fps=5`).
//!
//! Frames are read in file-name order. Useful for replaying captured footage
//! through a pipeline without a live camera.

use std::path::{Path, PathBuf};
use std::time::Instant;

use url::Url;

use super::{FrameSource, ReadOutcome, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct FileSource {
    uri: String,
    files: Vec<PathBuf>,
    position: usize,
    fps: Option<f64>,
    last_read_at: Option<Instant>,
    open: bool,
}

impl FileSource {
    pub fn open(url: &Url) -> Result<Self, SourceError> {
        let dir = url
            .to_file_path()
            .map_err(|_| SourceError::Unavailable(format!("not a local path: {}", url)))?;
        let fps = url
            .query_pairs()
            .find(|(key, _)| key == "fps")
            .and_then(|(_, value)| value.parse::<f64>().ok())
            .filter(|fps| *fps > 0.0);
        let files = list_frames(&dir)?;
        if files.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "no jpeg frames in {}",
                dir.display()
            )));
        }
        log::info!("FileSource: {} frames in {}", files.len(), dir.display());
        Ok(Self {
            uri: url.to_string(),
            files,
            position: 0,
            fps,
            last_read_at: None,
            open: true,
        })
    }
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SourceError::Unavailable(format!("read {}: {}", dir.display(), e)))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

impl FrameSource for FileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        if !self.open {
            return Err(SourceError::ReadFailed("source closed".to_string()));
        }
        let Some(path) = self.files.get(self.position) else {
            return Ok(ReadOutcome::EndOfStream);
        };
        self.position += 1;
        let bytes = std::fs::read(path)
            .map_err(|e| SourceError::ReadFailed(format!("read {}: {}", path.display(), e)))?;
        let frame = Frame::from_jpeg(&bytes)
            .map_err(|e| SourceError::ReadFailed(format!("{}: {:#}", path.display(), e)))?;
        self.last_read_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(frame))
    }

    fn grab(&mut self) -> Result<bool, SourceError> {
        if self.position >= self.files.len() {
            return Ok(false);
        }
        self.position += 1;
        self.last_read_at = Some(Instant::now());
        Ok(true)
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            uri: self.uri.clone(),
            open: self.open,
            frames_read: self.position as u64,
            last_read_at: self.last_read_at,
        }
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replays_frames_in_name_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("b.jpg"), Frame::filled(4, 2, [0, 0, 0]).to_jpeg()?)?;
        std::fs::write(dir.path().join("a.jpg"), Frame::filled(2, 4, [0, 0, 0]).to_jpeg()?)?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut url = Url::from_file_path(dir.path()).map_err(|_| anyhow::anyhow!("file url"))?;
        url.set_query(Some("fps=5"));
        let mut source = FileSource::open(&url)?;
        assert_eq!(source.fps(), Some(5.0));

        match source.read()? {
            ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (2, 4)),
            ReadOutcome::EndOfStream => panic!("expected a.jpg"),
        }
        assert!(source.grab()?);
        assert!(matches!(source.read()?, ReadOutcome::EndOfStream));
        Ok(())
    }

    #[test]
    fn empty_directory_is_unavailable() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let url = Url::from_file_path(dir.path()).map_err(|_| anyhow::anyhow!("file url"))?;
        assert!(matches!(
            FileSource::open(&url).err(),
            Some(SourceError::Unavailable(_))
        ));
        Ok(())
    }
}
