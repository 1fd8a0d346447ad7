//! Per-task retry state machine.
//!
//! ```text
//! Pending --begin_attempt--> InFlight --succeed--> Done
//!                               |
//!                               +--fail(retryable, budget left)--> Pending
//!                               +--fail(otherwise)---------------> Failed
//! ```
//!
//! `Done` and `Failed` are terminal for a run. `reset` returns any task to
//! `Pending` with a fresh attempt budget (forced refresh or re-run).

use canonbar_core::config::RetryPolicy;
use canonbar_core::domain::{AssetId, SourceId, TaskKey};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {key}: cannot {action} while {from}")]
pub struct TransitionError {
    pub key: TaskKey,
    pub action: &'static str,
    pub from: TaskStatus,
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Back to `Pending`; wait `delay` before the next attempt.
    Retry { delay: Duration },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillTask {
    pub asset_id: AssetId,
    pub day: NaiveDate,
    pub source: SourceId,
    pub status: TaskStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set by an operator on a `Failed` task to accept the gap.
    #[serde(default)]
    pub acknowledged: bool,
}

impl BackfillTask {
    pub fn new(key: TaskKey) -> Self {
        Self {
            asset_id: key.asset_id,
            day: key.day,
            source: key.source,
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_error: None,
            acknowledged: false,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.asset_id.clone(), self.day, self.source.clone())
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError {
            key: self.key(),
            action,
            from: self.status,
        }
    }

    /// `Pending -> InFlight`. Returns the attempt number (1-based).
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid("begin an attempt"));
        }
        self.status = TaskStatus::InFlight;
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// `InFlight -> Done`.
    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::InFlight {
            return Err(self.invalid("succeed"));
        }
        self.status = TaskStatus::Done;
        self.last_error = None;
        Ok(())
    }

    /// `InFlight -> Pending` (retry) or `InFlight -> Failed`.
    ///
    /// Non-retryable errors fail on the spot. Retryable ones go back to
    /// `Pending` while `policy` still allows another attempt.
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<Transition, TransitionError> {
        if self.status != TaskStatus::InFlight {
            return Err(self.invalid("fail"));
        }
        self.last_error = Some(reason.into());
        if retryable && policy.can_retry(self.attempt_count) {
            self.status = TaskStatus::Pending;
            Ok(Transition::Retry {
                delay: policy.delay_for(self.attempt_count),
            })
        } else {
            self.status = TaskStatus::Failed;
            Ok(Transition::Failed)
        }
    }

    /// Back to `Pending` with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempt_count = 0;
        self.last_error = None;
        self.acknowledged = false;
    }

    pub fn acknowledge(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid("acknowledge"));
        }
        self.acknowledged = true;
        Ok(())
    }

    /// Done, or Failed and accepted by an operator.
    pub fn is_settled(&self) -> bool {
        match self.status {
            TaskStatus::Done => true,
            TaskStatus::Failed => self.acknowledged,
            _ => false,
        }
    }
}
