//! CSV audit trail for per-subject decisions.
//!
//! One row per evaluated subject per sampled frame:
//! `frame,person_id,angle,status`, angle as two decimals or `N/A`,
//! status `Alert` / `No Alert`. The header is written only when the file is
//! created, so restarts append to the same log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const AUDIT_HEADER: &str = "frame,person_id,angle,status";

pub struct AuditLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let existed = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if !existed {
            writeln!(writer, "{}", AUDIT_HEADER)?;
            writer.flush()?;
        }
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it.
    pub fn record(
        &mut self,
        frame_index: u64,
        subject: usize,
        angle: Option<f64>,
        alerted: bool,
    ) -> Result<()> {
        let angle = match angle {
            Some(angle) => format!("{:.2}", angle),
            None => "N/A".to_string(),
        };
        let status = if alerted { "Alert" } else { "No Alert" };
        writeln!(self.writer, "{},{},{},{}", frame_index, subject, angle, status)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_once_and_formats_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs").join("alerts.csv");
        {
            let mut log = AuditLog::open(&path)?;
            log.record(1, 0, Some(87.456), false)?;
            log.record(2, 0, Some(20.0), true)?;
            log.record(2, 1, None, false)?;
        }
        {
            let mut log = AuditLog::open(&path)?;
            log.record(3, 0, Some(90.0), false)?;
        }
        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "frame,person_id,angle,status",
                "1,0,87.46,No Alert",
                "2,0,20.00,Alert",
                "2,1,N/A,No Alert",
                "3,0,90.00,No Alert",
            ]
        );
        Ok(())
    }

    #[test]
    fn existing_file_gets_no_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("alerts.csv");
        std::fs::write(&path, "")?;
        let mut log = AuditLog::open(&path)?;
        log.record(7, 0, Some(10.0), true)?;
        assert_eq!(std::fs::read_to_string(&path)?, "7,0,10.00,Alert\n");
        Ok(())
    }
}
