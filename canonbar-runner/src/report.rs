//! Run report: per-task outcome plus reconciliation results, with JSON and
//! CSV export.

use crate::task::TaskStatus;
use canonbar_core::domain::{AssetId, DayKey, TaskKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("json export failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub key: TaskKey,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub acknowledged: bool,
    /// Already settled before the run; not planned.
    pub skipped: bool,
    /// At least one attempt started during this run.
    pub dispatched: bool,
    /// Backoff waited after each failed attempt, in order.
    pub backoff_ms: Vec<u64>,
}

impl TaskOutcome {
    pub fn is_settled(&self) -> bool {
        match self.status {
            TaskStatus::Done => true,
            TaskStatus::Failed => self.acknowledged,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub key: DayKey,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub tasks: Vec<TaskOutcome>,
    /// Keys whose canonical record was (re)computed in this run.
    pub reconciled: Vec<DayKey>,
    /// Keys with unfinished tasks, left for a later run.
    pub unreconciled: Vec<DayKey>,
    pub discrepancies: usize,
    /// Requested assets skipped because they are deactivated.
    pub inactive_assets: Vec<AssetId>,
    pub write_failures: Vec<WriteFailure>,
}

impl RunReport {
    /// Every task is Done or an acknowledged Failure, and every reconciled
    /// key was written.
    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(TaskOutcome::is_settled) && self.write_failures.is_empty()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn dispatched(&self) -> usize {
        self.tasks.iter().filter(|t| t.dispatched).count()
    }

    pub fn skipped(&self) -> usize {
        self.tasks.iter().filter(|t| t.skipped).count()
    }

    pub fn task(&self, key: &TaskKey) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| &t.key == key)
    }

    pub fn summary(&self) -> String {
        format!(
            "run {}: {} tasks ({} done, {} failed, {} pending, {} skipped), {} keys reconciled, {} discrepancies{}",
            self.run_id,
            self.tasks.len(),
            self.count(TaskStatus::Done),
            self.count(TaskStatus::Failed),
            self.count(TaskStatus::Pending) + self.count(TaskStatus::InFlight),
            self.skipped(),
            self.reconciled.len(),
            self.discrepancies,
            if self.cancelled { ", cancelled" } else { "" },
        )
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One row per task.
    ///
    /// Columns: asset_id, day, source, status, attempt_count, acknowledged,
    /// skipped, dispatched, backoff_ms (`;`-separated), last_error
    pub fn to_csv(&self) -> Result<String, ReportError> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record([
            "asset_id",
            "day",
            "source",
            "status",
            "attempt_count",
            "acknowledged",
            "skipped",
            "dispatched",
            "backoff_ms",
            "last_error",
        ])?;
        for t in &self.tasks {
            let backoff = t
                .backoff_ms
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(";");
            let day = t.key.day.to_string();
            let attempts = t.attempt_count.to_string();
            let flags = [t.acknowledged, t.skipped, t.dispatched].map(|b| b.to_string());
            wtr.write_record([
                t.key.asset_id.as_str(),
                day.as_str(),
                t.key.source.as_str(),
                t.status.as_str(),
                attempts.as_str(),
                flags[0].as_str(),
                flags[1].as_str(),
                flags[2].as_str(),
                backoff.as_str(),
                t.last_error.as_deref().unwrap_or(""),
            ])?;
        }
        let bytes = wtr.into_inner().map_err(|e| ReportError::Io(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write as CSV when `path` ends in `.csv`, JSON otherwise.
    pub fn write_to(&self, path: &Path) -> Result<(), ReportError> {
        let body = match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => self.to_csv()?,
            _ => self.to_json()?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn outcome(day: u32, status: TaskStatus, acknowledged: bool) -> TaskOutcome {
        TaskOutcome {
            key: TaskKey::new(
                "btc".into(),
                NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                "binance".into(),
            ),
            status,
            attempt_count: 1,
            last_error: (status == TaskStatus::Failed).then(|| "bad, \"quoted\" row".to_string()),
            acknowledged,
            skipped: false,
            dispatched: true,
            backoff_ms: vec![500, 1000],
        }
    }

    fn report(tasks: Vec<TaskOutcome>) -> RunReport {
        RunReport {
            run_id: "run-test".into(),
            config_hash: "abc".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled: false,
            tasks,
            reconciled: vec![],
            unreconciled: vec![],
            discrepancies: 0,
            inactive_assets: vec![],
            write_failures: vec![],
        }
    }

    #[test]
    fn success_requires_settled_tasks() {
        assert!(report(vec![outcome(1, TaskStatus::Done, false)]).succeeded());
        assert!(!report(vec![outcome(1, TaskStatus::Failed, false)]).succeeded());
        assert!(report(vec![outcome(1, TaskStatus::Failed, true)]).succeeded());
        assert!(!report(vec![outcome(1, TaskStatus::Pending, false)]).succeeded());

        let mut r = report(vec![outcome(1, TaskStatus::Done, false)]);
        r.write_failures.push(WriteFailure {
            key: DayKey::new("btc".into(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            error: "conflict".into(),
        });
        assert!(!r.succeeded());
    }

    #[test]
    fn csv_has_one_row_per_task() {
        let r = report(vec![
            outcome(1, TaskStatus::Done, false),
            outcome(2, TaskStatus::Failed, false),
        ]);
        let csv = r.to_csv().unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][3], "failed");
        assert_eq!(&rows[1][8], "500;1000");
        assert_eq!(&rows[1][9], "bad, \"quoted\" row");
    }

    #[test]
    fn json_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let r = report(vec![outcome(1, TaskStatus::Done, false)]);
        r.write_to(&path).unwrap();
        let back: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.tasks, r.tasks);
        assert!(r.summary().contains("1 done"));
    }
}
