use crate::ledger::LedgerError;
use canonbar_core::domain::{AssetId, RangeError};
use canonbar_core::error::StoreError;
use thiserror::Error;

/// Errors that stop a backfill run before or after its tasks execute.
///
/// Per-task failures never surface here; they end as `Failed` tasks in the
/// run report.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("unknown asset '{0}'")]
    UnknownAsset(AssetId),

    #[error("backfill request names no assets")]
    NoAssets,

    #[error(transparent)]
    InvalidRange(#[from] RangeError),

    #[error("no source adapters configured")]
    NoSources,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to start worker pool: {0}")]
    Pool(String),
}
