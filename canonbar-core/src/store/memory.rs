use super::{check_asset_id, AssetRegistry, CanonicalStore, PutOutcome, RawStore};
use crate::domain::{Asset, AssetId, CanonicalRecord, DayKey, RawRecord, TaskKey};
use crate::error::StoreError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory store. Poisoned locks are recovered: every write is a single
/// map operation, so a panicking writer cannot leave a half-applied record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    assets: RwLock<BTreeMap<AssetId, Asset>>,
    raw: RwLock<BTreeMap<TaskKey, RawRecord>>,
    canonical: RwLock<BTreeMap<DayKey, CanonicalRecord>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = Asset>) -> Result<Self, StoreError> {
        let store = Self::new();
        for asset in assets {
            store.register(asset)?;
        }
        Ok(store)
    }

    pub fn raw_len(&self) -> usize {
        read(&self.raw).len()
    }

    pub fn canonical_len(&self) -> usize {
        read(&self.canonical).len()
    }

    fn require_asset(&self, asset_id: &AssetId) -> Result<(), StoreError> {
        if read(&self.assets).contains_key(asset_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownAsset(asset_id.clone()))
        }
    }
}

impl AssetRegistry for MemoryStore {
    fn register(&self, asset: Asset) -> Result<(), StoreError> {
        check_asset_id(&asset.asset_id)?;
        let mut assets = write(&self.assets);
        if assets.contains_key(&asset.asset_id) {
            return Err(StoreError::DuplicateAsset(asset.asset_id));
        }
        assets.insert(asset.asset_id.clone(), asset);
        Ok(())
    }

    fn deactivate(&self, asset_id: &AssetId, at: DateTime<Utc>) -> Result<Asset, StoreError> {
        let mut assets = write(&self.assets);
        let asset = assets
            .get_mut(asset_id)
            .ok_or_else(|| StoreError::UnknownAsset(asset_id.clone()))?;
        if asset.deactivated_at.is_none() {
            asset.deactivated_at = Some(at);
        }
        Ok(asset.clone())
    }

    fn asset(&self, asset_id: &AssetId) -> Result<Option<Asset>, StoreError> {
        Ok(read(&self.assets).get(asset_id).cloned())
    }

    fn assets(&self) -> Result<Vec<Asset>, StoreError> {
        Ok(read(&self.assets).values().cloned().collect())
    }
}

impl RawStore for MemoryStore {
    fn put_raw(&self, record: RawRecord) -> Result<PutOutcome, StoreError> {
        self.require_asset(&record.asset_id)?;
        let mut raw = write(&self.raw);
        let key = record.key();
        match raw.get(&key) {
            Some(existing) if existing.fetched_at >= record.fetched_at => Ok(PutOutcome::Ignored),
            Some(_) => {
                raw.insert(key, record);
                Ok(PutOutcome::Superseded)
            }
            None => {
                raw.insert(key, record);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn raw_records(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Vec<RawRecord>, StoreError> {
        Ok(read(&self.raw)
            .values()
            .filter(|r| &r.asset_id == asset_id && r.day == day)
            .cloned()
            .collect())
    }
}

impl CanonicalStore for MemoryStore {
    fn upsert(&self, record: CanonicalRecord) -> Result<(), StoreError> {
        self.require_asset(&record.asset_id)?;
        write(&self.canonical).insert(record.key(), record);
        Ok(())
    }

    fn canonical(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Option<CanonicalRecord>, StoreError> {
        Ok(read(&self.canonical)
            .get(&DayKey::new(asset_id.clone(), day))
            .cloned())
    }

    fn canonical_records(&self, asset_id: &AssetId) -> Result<Vec<CanonicalRecord>, StoreError> {
        Ok(read(&self.canonical)
            .values()
            .filter(|r| &r.asset_id == asset_id)
            .cloned()
            .collect())
    }

    fn all_canonical(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        Ok(read(&self.canonical).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetType;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, h, 0, 0).unwrap()
    }

    fn store() -> MemoryStore {
        MemoryStore::with_assets([Asset::new("btc", "BTC", AssetType::Coin, at(0))]).unwrap()
    }

    fn raw(source: &str, high: f64, fetched_h: u32) -> RawRecord {
        RawRecord {
            asset_id: "btc".into(),
            day: day(1),
            source: source.into(),
            high,
            low: 1.0,
            volume: 1.0,
            open: None,
            close: None,
            fetched_at: at(fetched_h),
        }
    }

    fn canonical(d: u32, high: f64) -> CanonicalRecord {
        CanonicalRecord {
            asset_id: "btc".into(),
            day: day(d),
            high,
            low: 1.0,
            volume: 1.0,
            open: None,
            close: None,
            contributing_sources: BTreeSet::from(["a".into()]),
            ingested_at: at(1),
        }
    }

    #[test]
    fn register_rejects_duplicates_and_bad_ids() {
        let s = store();
        let err = s
            .register(Asset::new("btc", "BTC", AssetType::Coin, at(0)))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAsset(_)));
        assert!(matches!(
            s.register(Asset::new("a/b", "X", AssetType::Other, at(0))),
            Err(StoreError::InvalidAsset(_))
        ));
    }

    #[test]
    fn deactivate_keeps_first_stamp() {
        let s = store();
        let id = AssetId::from("btc");
        assert!(s.deactivate(&id, at(3)).unwrap().deactivated_at == Some(at(3)));
        assert!(s.deactivate(&id, at(5)).unwrap().deactivated_at == Some(at(3)));
        assert!(!s.asset(&id).unwrap().unwrap().is_active());
        assert!(s.deactivate(&"eth".into(), at(3)).is_err());
    }

    #[test]
    fn later_fetch_supersedes_raw() {
        let s = store();
        assert_eq!(s.put_raw(raw("a", 10.0, 2)).unwrap(), PutOutcome::Inserted);
        assert_eq!(s.put_raw(raw("a", 11.0, 1)).unwrap(), PutOutcome::Ignored);
        assert_eq!(s.put_raw(raw("a", 12.0, 3)).unwrap(), PutOutcome::Superseded);
        assert_eq!(s.put_raw(raw("b", 9.0, 1)).unwrap(), PutOutcome::Inserted);

        let recs = s.raw_records(&"btc".into(), day(1)).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].high, 12.0);
        assert_eq!(s.raw_len(), 2);
    }

    #[test]
    fn writes_require_registered_asset() {
        let s = MemoryStore::new();
        assert!(matches!(s.put_raw(raw("a", 1.0, 1)), Err(StoreError::UnknownAsset(_))));
        assert!(s.upsert(canonical(1, 1.0)).is_err());
    }

    #[test]
    fn upsert_replaces_by_key() {
        let s = store();
        s.upsert(canonical(1, 10.0)).unwrap();
        s.upsert(canonical(2, 20.0)).unwrap();
        s.upsert(canonical(1, 15.0)).unwrap();

        assert_eq!(s.canonical_len(), 2);
        assert_eq!(s.canonical(&"btc".into(), day(1)).unwrap().unwrap().high, 15.0);
        assert_eq!(s.canonical_records(&"btc".into()).unwrap().len(), 2);
    }

    #[test]
    fn snapshot_hash_tracks_content() {
        let a = store();
        let b = store();
        a.upsert(canonical(1, 10.0)).unwrap();
        a.upsert(canonical(2, 20.0)).unwrap();
        b.upsert(canonical(2, 20.0)).unwrap();
        b.upsert(canonical(1, 10.0)).unwrap();
        assert_eq!(a.snapshot_hash().unwrap(), b.snapshot_hash().unwrap());

        b.upsert(canonical(1, 11.0)).unwrap();
        assert_ne!(a.snapshot_hash().unwrap(), b.snapshot_hash().unwrap());
    }
}
