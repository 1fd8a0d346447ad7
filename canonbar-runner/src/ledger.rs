//! Task ledger: every backfill task ever planned, keyed by
//! `(asset_id, day, source)`, persisted as `backfill_tasks.json`.
//!
//! The file is rewritten atomically (temp file + rename). A missing file is an
//! empty ledger.

use crate::task::{BackfillTask, TaskStatus, TransitionError};
use canonbar_core::domain::TaskKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const LEDGER_FILE: &str = "backfill_tasks.json";
const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("ledger {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("ledger {path} has unsupported version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("no task {0} in the ledger")]
    UnknownTask(TaskKey),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    tasks: Vec<BackfillTask>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskLedger {
    tasks: BTreeMap<TaskKey, BackfillTask>,
    path: Option<PathBuf>,
}

impl TaskLedger {
    /// In-memory ledger; `save` is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, or start empty if it does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger yet, starting empty");
                return Ok(Self {
                    tasks: BTreeMap::new(),
                    path: Some(path),
                });
            }
            Err(e) => {
                return Err(LedgerError::Io {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let file: LedgerFile = serde_json::from_str(&content).map_err(|e| LedgerError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if file.version > LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path,
                found: file.version,
            });
        }

        let tasks = file.tasks.into_iter().map(|t| (t.key(), t)).collect();
        Ok(Self {
            tasks,
            path: Some(path),
        })
    }

    /// Ledger stored next to the data under `root`.
    pub fn in_dir(root: &Path) -> Result<Self, LedgerError> {
        Self::load(root.join(LEDGER_FILE))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| LedgerError::Io {
            path: path.clone(),
            reason: e.to_string(),
        };

        let file = LedgerFile {
            version: LEDGER_VERSION,
            tasks: self.tasks.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| LedgerError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        })?;
        debug!(path = %path.display(), tasks = self.tasks.len(), "saved task ledger");
        Ok(())
    }

    /// Ledger entry for `key`, if one was ever planned.
    pub fn get(&self, key: &TaskKey) -> Option<&BackfillTask> {
        self.tasks.get(key)
    }

    /// Mutable ledger entry for `key`. Does not create one; see `entry`.
    pub fn get_mut(&mut self, key: &TaskKey) -> Option<&mut BackfillTask> {
        self.tasks.get_mut(key)
    }

    /// The task for `key`, created `Pending` if absent.
    pub fn entry(&mut self, key: TaskKey) -> &mut BackfillTask {
        self.tasks
            .entry(key)
            .or_insert_with_key(|k| BackfillTask::new(k.clone()))
    }

    /// Tasks in key order.
    pub fn tasks(&self) -> impl Iterator<Item = &BackfillTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks currently in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Failed tasks nobody has acknowledged yet.
    pub fn unacknowledged_failures(&self) -> Vec<&BackfillTask> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && !t.acknowledged)
            .collect()
    }

    pub fn acknowledge(&mut self, key: &TaskKey) -> Result<(), LedgerError> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| LedgerError::UnknownTask(key.clone()))?;
        task.acknowledge()?;
        info!(task = %key, "acknowledged failed task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonbar_core::config::RetryPolicy;
    use chrono::NaiveDate;

    fn key(day: u32, source: &str) -> TaskKey {
        TaskKey::new(
            "btc".into(),
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            source.into(),
        )
    }

    fn failed(ledger: &mut TaskLedger, k: TaskKey) {
        let task = ledger.entry(k);
        task.begin_attempt().unwrap();
        task.fail("bad data", false, &RetryPolicy::default()).unwrap();
    }

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TaskLedger::in_dir(dir.path()).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.path(), Some(dir.path().join(LEDGER_FILE).as_path()));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::in_dir(dir.path()).unwrap();
        ledger.entry(key(1, "a"));
        failed(&mut ledger, key(2, "b"));
        ledger.save().unwrap();

        let loaded = TaskLedger::in_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&key(2, "b")).unwrap().status, TaskStatus::Failed);
        assert_eq!(loaded.count(TaskStatus::Pending), 1);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn acknowledge_only_failed_tasks() {
        let mut ledger = TaskLedger::new();
        ledger.entry(key(1, "a"));
        failed(&mut ledger, key(2, "a"));

        assert!(matches!(
            ledger.acknowledge(&key(1, "a")),
            Err(LedgerError::Transition(_))
        ));
        assert!(matches!(
            ledger.acknowledge(&key(9, "a")),
            Err(LedgerError::UnknownTask(_))
        ));
        assert_eq!(ledger.unacknowledged_failures().len(), 1);
        ledger.acknowledge(&key(2, "a")).unwrap();
        assert!(ledger.unacknowledged_failures().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LEDGER_FILE), "{not json").unwrap();
        assert!(matches!(
            TaskLedger::in_dir(dir.path()),
            Err(LedgerError::Corrupt { .. })
        ));
    }
}
