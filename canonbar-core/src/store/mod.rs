//! Storage for assets, raw records and canonical records.
//!
//! - `MemoryStore`: lock-protected maps, for tests and dry runs
//! - `ParquetStore`: Hive-partitioned Parquet tables with atomic replace
//! - `CanonicalWriter`: upsert wrapper that retries write conflicts

mod frames;
pub mod memory;
pub mod parquet;
pub mod writer;

pub use memory::MemoryStore;
pub use parquet::{MigrationOutcome, ParquetStore, StoreStatus};
pub use writer::CanonicalWriter;

use crate::domain::{Asset, AssetId, CanonicalRecord, RawRecord};
use crate::error::StoreError;
use chrono::{DateTime, NaiveDate, Utc};

/// Administrative registry behind the `assets` table.
pub trait AssetRegistry: Send + Sync {
    /// Fails with `DuplicateAsset` if the id is taken.
    fn register(&self, asset: Asset) -> Result<(), StoreError>;

    /// Stamp `deactivated_at`. Deactivating twice keeps the first stamp.
    fn deactivate(&self, asset_id: &AssetId, at: DateTime<Utc>) -> Result<Asset, StoreError>;

    fn asset(&self, asset_id: &AssetId) -> Result<Option<Asset>, StoreError>;

    /// All assets, ordered by id.
    fn assets(&self) -> Result<Vec<Asset>, StoreError>;
}

/// Result of storing a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Replaced an older fetch of the same key.
    Superseded,
    /// An equal or newer fetch is already stored.
    Ignored,
}

pub trait RawStore: Send + Sync {
    /// Store a raw record; the later `fetched_at` wins per `(asset_id, day, source)`.
    fn put_raw(&self, record: RawRecord) -> Result<PutOutcome, StoreError>;

    /// Every source's record for `(asset_id, day)`, ordered by source.
    fn raw_records(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Vec<RawRecord>, StoreError>;
}

pub trait CanonicalStore: Send + Sync {
    /// Atomic replace keyed by `(asset_id, day)`.
    fn upsert(&self, record: CanonicalRecord) -> Result<(), StoreError>;

    fn canonical(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Option<CanonicalRecord>, StoreError>;

    /// Records of one asset, ordered by day.
    fn canonical_records(&self, asset_id: &AssetId) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// Every canonical record, ordered by `(asset_id, day)`.
    fn all_canonical(&self) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// BLAKE3 digest of the full canonical state.
    fn snapshot_hash(&self) -> Result<String, StoreError> {
        let mut records = self.all_canonical()?;
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        let json = serde_json::to_vec(&records)?;
        Ok(blake3::hash(&json).to_hex().to_string())
    }
}

/// Everything the backfill pipeline needs from a store.
pub trait Store: AssetRegistry + RawStore + CanonicalStore {}

impl<T: AssetRegistry + RawStore + CanonicalStore> Store for T {}

pub(crate) fn check_asset_id(asset_id: &AssetId) -> Result<(), StoreError> {
    if asset_id.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidAsset(asset_id.clone()))
    }
}
