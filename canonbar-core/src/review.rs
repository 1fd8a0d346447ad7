//! Manual-review side channel for discrepancy flags.
//!
//! Submitting a flag never blocks or fails a canonical write: callers log sink
//! errors and move on.

use crate::reconcile::DiscrepancyFlag;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Receiver of discrepancy flags.
pub trait ReviewSink: Send + Sync {
    fn submit(&self, flag: &DiscrepancyFlag) -> io::Result<()>;
}

/// In-memory queue; used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryReviewQueue {
    flags: Mutex<Vec<DiscrepancyFlag>>,
}

impl MemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> Vec<DiscrepancyFlag> {
        self.flags
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.flags().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReviewSink for MemoryReviewQueue {
    fn submit(&self, flag: &DiscrepancyFlag) -> io::Result<()> {
        self.flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(flag.clone());
        Ok(())
    }
}

/// Append-only JSON-lines log, one flag per line.
pub struct JsonlReviewLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlReviewLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every flag in the log. Malformed lines are skipped.
    pub fn read_all(&self) -> io::Result<Vec<DiscrepancyFlag>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = io::BufReader::new(fs::File::open(&self.path)?);
        let mut flags = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DiscrepancyFlag>(&line) {
                Ok(flag) => flags.push(flag),
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "skipping malformed review line"),
            }
        }
        Ok(flags)
    }
}

impl ReviewSink for JsonlReviewLog {
    fn submit(&self, flag: &DiscrepancyFlag) -> io::Result<()> {
        let json = serde_json::to_string(flag)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::PriceField;
    use chrono::NaiveDate;

    fn flag(other: &str) -> DiscrepancyFlag {
        DiscrepancyFlag {
            asset_id: "btc".into(),
            day: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            field: PriceField::High,
            primary_source: "a".into(),
            other_source: other.into(),
            primary_value: 100.0,
            other_value: 95.0,
            relative_diff: 0.05,
        }
    }

    #[test]
    fn memory_queue_collects() {
        let q = MemoryReviewQueue::new();
        assert!(q.is_empty());
        q.submit(&flag("b")).unwrap();
        q.submit(&flag("c")).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.flags()[1].other_source.as_str(), "c");
    }

    #[test]
    fn jsonl_log_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlReviewLog::new(dir.path().join("review").join("flags.jsonl"));

        assert!(log.read_all().unwrap().is_empty());
        log.submit(&flag("b")).unwrap();
        log.submit(&flag("c")).unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);

        let back = log.read_all().unwrap();
        assert_eq!(back, vec![flag("b"), flag("c")]);
    }

    #[test]
    fn jsonl_log_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.jsonl");
        fs::write(&path, "not json\n\n").unwrap();

        let log = JsonlReviewLog::new(&path);
        log.submit(&flag("b")).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
    }
}
