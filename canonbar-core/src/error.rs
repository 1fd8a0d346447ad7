//! Structured error types for fetching and storage.
//!
//! Every error knows whether it is retryable. The orchestrator uses that
//! classification to decide between `Pending` (retry) and `Failed`.

use crate::domain::{AssetId, SourceId};
use chrono::NaiveDate;
use thiserror::Error;

/// Errors produced by source adapters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Network unreachable, timeout, 5xx. Retryable.
    #[error("transient fetch failure from {provider}: {reason}")]
    Transient { provider: SourceId, reason: String },

    /// Provider rate limit (HTTP 429). Retryable.
    #[error("rate limited by {provider} (retry after {retry_after_secs}s)")]
    RateLimited {
        provider: SourceId,
        retry_after_secs: u64,
    },

    /// Circuit breaker is open for this source. Retryable once it cools down.
    #[error("circuit breaker open for {provider}")]
    CircuitOpen { provider: SourceId },

    /// Malformed or missing data. Not retryable; scoped to a day when known.
    #[error("data format error from {provider}{}: {reason}", day_suffix(.day))]
    DataFormat {
        provider: SourceId,
        day: Option<NaiveDate>,
        reason: String,
    },

    /// A record whose window cannot be assigned to one UTC day. Not retryable.
    #[error("granularity mismatch: {reason}")]
    GranularityMismatch { reason: String },
}

fn day_suffix(day: &Option<NaiveDate>) -> String {
    day.map(|d| format!(" for {d}")).unwrap_or_default()
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. }
                | FetchError::RateLimited { .. }
                | FetchError::CircuitOpen { .. }
        )
    }

    /// The day a data error is attached to, if any.
    pub fn day(&self) -> Option<NaiveDate> {
        match self {
            FetchError::DataFormat { day, .. } => *day,
            _ => None,
        }
    }

    pub fn data_format(provider: &SourceId, day: NaiveDate, reason: impl Into<String>) -> Self {
        FetchError::DataFormat {
            provider: provider.clone(),
            day: Some(day),
            reason: reason.into(),
        }
    }

    pub fn transient(provider: &SourceId, reason: impl Into<String>) -> Self {
        FetchError::Transient {
            provider: provider.clone(),
            reason: reason.into(),
        }
    }
}

/// Errors produced by the canonical and raw stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target partition changed underneath the write. Retryable.
    #[error("write conflict on {asset_id}@{day}")]
    WriteConflict { asset_id: AssetId, day: NaiveDate },

    #[error("unknown asset '{0}'")]
    UnknownAsset(AssetId),

    #[error("asset '{0}' is already registered")]
    DuplicateAsset(AssetId),

    #[error("invalid asset id '{0}'")]
    InvalidAsset(AssetId),

    #[error("schema mismatch in {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("table {table} is at schema v{found}, current is v{current}; run `store migrate`")]
    MigrationRequired {
        table: String,
        found: u32,
        current: u32,
    },

    #[error("no migration path for {table} from v{from} to v{to}")]
    NoMigrationPath { table: String, from: u32, to: u32 },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteConflict { .. })
    }
}

impl From<polars::prelude::PolarsError> for StoreError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        StoreError::Parquet(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}
