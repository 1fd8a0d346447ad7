//! Canonbar Core: domain types, source adapters, time alignment,
//! reconciliation and the canonical store.
//!
//! - Domain types (assets, raw and canonical records, day ranges, keys)
//! - Source adapters with a lazy per-day `fetch` contract
//! - UTC day alignment and intraday aggregation
//! - Priority-based reconciliation with discrepancy flagging
//! - Versioned Parquet store with idempotent upserts and migrations

pub mod adapter;
pub mod align;
pub mod config;
pub mod domain;
pub mod error;
pub mod migration;
pub mod reconcile;
pub mod review;
pub mod schema;
pub mod store;

pub use config::{ConfigError, PipelineConfig, RetryPolicy};
pub use error::{FetchError, StoreError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: shared types cross the worker pool.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::Asset>();
        require_sync::<domain::Asset>();
        require_send::<domain::RawRecord>();
        require_sync::<domain::RawRecord>();
        require_send::<domain::CanonicalRecord>();
        require_sync::<domain::CanonicalRecord>();
        require_send::<domain::TaskKey>();
        require_sync::<domain::TaskKey>();
        require_send::<FetchError>();
        require_sync::<FetchError>();
        require_send::<StoreError>();
        require_sync::<StoreError>();

        require_send::<reconcile::Reconciler>();
        require_sync::<reconcile::Reconciler>();
        require_send::<reconcile::DiscrepancyFlag>();
        require_sync::<reconcile::DiscrepancyFlag>();

        require_send::<adapter::HttpAdapter>();
        require_sync::<adapter::HttpAdapter>();
        require_send::<adapter::CsvAdapter>();
        require_sync::<adapter::CsvAdapter>();
        require_send::<adapter::FixtureAdapter>();
        require_sync::<adapter::FixtureAdapter>();
        require_send::<adapter::CircuitBreaker>();
        require_sync::<adapter::CircuitBreaker>();

        require_send::<store::MemoryStore>();
        require_sync::<store::MemoryStore>();
        require_send::<store::ParquetStore>();
        require_sync::<store::ParquetStore>();
        require_send::<review::JsonlReviewLog>();
        require_sync::<review::JsonlReviewLog>();
    }

    /// Adapters are only readers: the trait exposes no store handle.
    #[test]
    fn adapter_trait_has_no_store_parameter() {
        fn _check_trait_object_builds<'a>(
            adapter: &'a dyn adapter::SourceAdapter,
            asset: &domain::Asset,
            range: domain::DayRange,
        ) -> adapter::RecordStream<'a> {
            adapter.fetch(asset, range)
        }
    }
}
