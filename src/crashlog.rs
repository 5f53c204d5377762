use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::IoError;
use crate::tier::PerformanceTier;

pub const DEFAULT_CRASH_LOG: &str = "crash_report.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashKind {
    Encode,
    Io,
    Fatal,
}

/// One JSON line in the crash log.
#[derive(Debug, Clone, Serialize)]
pub struct CrashRecord {
    pub timestamp_unix: u64,
    pub version: &'static str,
    pub tier: PerformanceTier,
    pub kind: CrashKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub message: String,
}

impl CrashRecord {
    pub fn new(tier: PerformanceTier, kind: CrashKind, message: impl Into<String>) -> Self {
        Self {
            timestamp_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            version: env!("CARGO_PKG_VERSION"),
            tier,
            kind,
            batch_index: None,
            output_path: None,
            message: message.into(),
        }
    }

    pub fn batch(mut self, index: usize) -> Self {
        self.batch_index = Some(index);
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Append-only JSON-lines file, shared across merge workers.
#[derive(Debug)]
pub struct CrashLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CrashLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &CrashRecord) -> Result<(), IoError> {
        let mut line = serde_json::to_string(record).map_err(|e| {
            IoError::new(
                "serialize crash record",
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| IoError::new("create", dir, e))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| IoError::new("open", &self.path, e))?;
        f.write_all(line.as_bytes())
            .map_err(|e| IoError::new("append", &self.path, e))?;
        Ok(())
    }

    /// Appends, downgrading a write failure to a warning.
    pub fn record(&self, record: CrashRecord) {
        match self.append(&record) {
            Ok(()) => tracing::debug!(path = %self.path.display(), kind = ?record.kind, "crash record written"),
            Err(e) => tracing::warn!(error = %e, "could not write crash record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_object_per_line() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let log = CrashLog::new(tmp.path().join("logs").join(DEFAULT_CRASH_LOG));

        log.append(
            &CrashRecord::new(PerformanceTier::UltimateStability, CrashKind::Encode, "exit 1")
                .batch(3)
                .output("/out/x.mp4"),
        )
        .expect("first append");
        log.append(&CrashRecord::new(
            PerformanceTier::UltimateStability,
            CrashKind::Fatal,
            "worker thread panicked",
        ))
        .expect("second append");

        let text = std::fs::read_to_string(log.path()).expect("read log");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "encode");
        assert_eq!(lines[0]["tier"], "ultimatestability");
        assert_eq!(lines[0]["batch_index"], 3);
        assert_eq!(lines[0]["message"], "exit 1");
        assert_eq!(lines[1]["kind"], "fatal");
        assert!(lines[1].get("batch_index").is_none());
    }
}
