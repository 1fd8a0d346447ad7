//! Parquet-backed canonical store with Hive-style partitioning.
//!
//! Layout under `root`:
//! - `assets.parquet`
//! - `prices_daily/asset_id={ID}/{year}.parquet`
//! - `raw_daily/asset_id={ID}/{year}.parquet`
//! - `schema.json` (stored table versions)
//!
//! Every write rewrites one partition file: write to a temp file, then rename
//! into place, so readers see either the old or the new partition and never a
//! partial one. Writers of the same partition are serialized by an in-process
//! lock; if the partition file changed between read and rename (another
//! process), the write fails with `WriteConflict`.

use super::frames;
use super::{check_asset_id, AssetRegistry, CanonicalStore, PutOutcome, RawStore};
use crate::domain::{Asset, AssetId, CanonicalRecord, RawRecord};
use crate::error::StoreError;
use crate::migration;
use crate::schema::{
    SchemaVersions, TableSchema, ASSETS, ASSETS_SCHEMA, PRICES_DAILY, PRICES_DAILY_SCHEMA,
    RAW_DAILY, RAW_DAILY_SCHEMA,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use polars::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const SCHEMA_FILE: &str = "schema.json";
const ASSETS_FILE: &str = "assets.parquet";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct ParquetStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Summary of an on-disk store, readable even when a migration is pending.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub versions: SchemaVersions,
    /// Tables behind their current version: (table, found, current).
    pub outdated: Vec<(String, u32, u32)>,
    pub price_partitions: usize,
    pub raw_partitions: usize,
    pub has_assets: bool,
}

/// One table brought up to date by `migrate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub table: String,
    pub from: u32,
    pub to: u32,
    pub files_rewritten: usize,
}

impl ParquetStore {
    /// Open (or create) a store. Fails with `MigrationRequired` when any table
    /// is stored at an older version.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let versions = match read_versions(&root)? {
            Some(v) => v,
            None if is_empty_store(&root) => {
                let v = SchemaVersions::current();
                write_versions(&root, &v)?;
                info!(root = %root.display(), "initialized new store");
                v
            }
            // Data written before schema.json existed.
            None => SchemaVersions(Default::default()),
        };

        if let Some((schema, found)) = versions.outdated().into_iter().next() {
            return Err(StoreError::MigrationRequired {
                table: schema.name.to_string(),
                found,
                current: schema.version,
            });
        }

        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Inspect a store without opening it.
    pub fn status(root: &Path) -> Result<StoreStatus, StoreError> {
        let versions = match read_versions(root)? {
            Some(v) => v,
            None if is_empty_store(root) => SchemaVersions::current(),
            None => SchemaVersions(Default::default()),
        };
        let outdated = versions
            .outdated()
            .into_iter()
            .map(|(t, found)| (t.name.to_string(), found, t.version))
            .collect();
        Ok(StoreStatus {
            root: root.to_path_buf(),
            outdated,
            versions,
            price_partitions: partition_files(&root.join(PRICES_DAILY))?.len(),
            raw_partitions: partition_files(&root.join(RAW_DAILY))?.len(),
            has_assets: root.join(ASSETS_FILE).exists(),
        })
    }

    /// Rewrite every outdated table through its registered migration chain
    /// and record the new versions in `schema.json`.
    pub fn migrate(root: &Path) -> Result<Vec<MigrationOutcome>, StoreError> {
        fs::create_dir_all(root)?;
        let mut versions = match read_versions(root)? {
            Some(v) => v,
            None if is_empty_store(root) => SchemaVersions::current(),
            None => SchemaVersions(Default::default()),
        };

        let mut outcomes = Vec::new();
        for (schema, found) in versions.outdated() {
            let steps = migration::plan(schema.name, found, schema.version)?;
            let files = table_files(root, schema.name)?;
            for path in &files {
                let df = read_parquet(path)?;
                let mut migrated = migration::apply(schema.name, df, &steps)?;
                write_parquet_atomic(path, &mut migrated)?;
            }
            info!(
                table = schema.name,
                from = found,
                to = schema.version,
                files = files.len(),
                "migrated table"
            );
            versions.set(schema.name, schema.version);
            outcomes.push(MigrationOutcome {
                table: schema.name.to_string(),
                from: found,
                to: schema.version,
                files_rewritten: files.len(),
            });
        }
        write_versions(root, &versions)?;
        Ok(outcomes)
    }

    fn partition_path(&self, table: &str, asset_id: &AssetId, year: i32) -> PathBuf {
        self.root
            .join(table)
            .join(format!("asset_id={asset_id}"))
            .join(format!("{year}.parquet"))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Read-modify-write of one partition under its lock.
    ///
    /// `modify` returns `false` to skip the write (nothing changed).
    fn rewrite<T, R, W>(
        &self,
        path: &Path,
        schema: &TableSchema,
        read: R,
        write: W,
        conflict: impl Fn() -> StoreError,
        modify: impl FnOnce(&mut Vec<T>) -> bool,
    ) -> Result<(), StoreError>
    where
        R: Fn(&DataFrame) -> Result<Vec<T>, StoreError>,
        W: Fn(&[T]) -> Result<DataFrame, StoreError>,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let before = file_digest(path)?;
        let mut rows = match before {
            Some(_) => {
                let df = read_parquet(path)?;
                schema.validate(&df)?;
                read(&df)?
            }
            None => Vec::new(),
        };

        if !modify(&mut rows) {
            return Ok(());
        }

        let mut df = write(&rows)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(path);
        write_parquet(&tmp, &mut df)?;

        if file_digest(path)? != before {
            let _ = fs::remove_file(&tmp);
            warn!(path = %path.display(), "partition changed during write");
            return Err(conflict());
        }
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(e)
        })?;
        Ok(())
    }

    fn load_assets(&self) -> Result<Vec<Asset>, StoreError> {
        let path = self.root.join(ASSETS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let df = read_parquet(&path)?;
        ASSETS_SCHEMA.validate(&df)?;
        frames::frame_to_assets(&df)
    }

    fn update_assets(&self, modify: impl FnOnce(&mut Vec<Asset>) -> Result<(), StoreError>) -> Result<(), StoreError> {
        let path = self.root.join(ASSETS_FILE);
        let mut outcome = Ok(());
        self.rewrite(
            &path,
            &ASSETS_SCHEMA,
            frames::frame_to_assets,
            frames::assets_to_frame,
            || StoreError::SchemaMismatch {
                table: ASSETS.to_string(),
                reason: "assets table changed during write".to_string(),
            },
            |assets| match modify(assets) {
                Ok(()) => {
                    assets.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            },
        )?;
        outcome
    }

    fn require_asset(&self, asset_id: &AssetId) -> Result<(), StoreError> {
        if self.asset(asset_id)?.is_some() {
            Ok(())
        } else {
            Err(StoreError::UnknownAsset(asset_id.clone()))
        }
    }

    fn read_table<T>(
        &self,
        table: &str,
        asset_id: Option<&AssetId>,
        schema: &TableSchema,
        read: impl Fn(&DataFrame) -> Result<Vec<T>, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let dir = match asset_id {
            Some(id) => self.root.join(table).join(format!("asset_id={id}")),
            None => self.root.join(table),
        };
        let mut out = Vec::new();
        for path in partition_files(&dir)? {
            let df = read_parquet(&path)?;
            schema.validate(&df)?;
            out.extend(read(&df)?);
        }
        Ok(out)
    }
}

impl AssetRegistry for ParquetStore {
    fn register(&self, asset: Asset) -> Result<(), StoreError> {
        check_asset_id(&asset.asset_id)?;
        let id = asset.asset_id.clone();
        self.update_assets(|assets| {
            if assets.iter().any(|a| a.asset_id == asset.asset_id) {
                return Err(StoreError::DuplicateAsset(asset.asset_id.clone()));
            }
            assets.push(asset);
            Ok(())
        })?;
        info!(asset_id = %id, "registered asset");
        Ok(())
    }

    fn deactivate(&self, asset_id: &AssetId, at: DateTime<Utc>) -> Result<Asset, StoreError> {
        let mut updated = None;
        self.update_assets(|assets| {
            let asset = assets
                .iter_mut()
                .find(|a| &a.asset_id == asset_id)
                .ok_or_else(|| StoreError::UnknownAsset(asset_id.clone()))?;
            if asset.deactivated_at.is_none() {
                asset.deactivated_at = Some(at);
            }
            updated = Some(asset.clone());
            Ok(())
        })?;
        updated.ok_or_else(|| StoreError::UnknownAsset(asset_id.clone()))
    }

    fn asset(&self, asset_id: &AssetId) -> Result<Option<Asset>, StoreError> {
        Ok(self
            .load_assets()?
            .into_iter()
            .find(|a| &a.asset_id == asset_id))
    }

    fn assets(&self) -> Result<Vec<Asset>, StoreError> {
        let mut assets = self.load_assets()?;
        assets.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(assets)
    }
}

impl RawStore for ParquetStore {
    fn put_raw(&self, record: RawRecord) -> Result<PutOutcome, StoreError> {
        self.require_asset(&record.asset_id)?;
        let path = self.partition_path(RAW_DAILY, &record.asset_id, record.day.year());
        let (asset_id, day) = (record.asset_id.clone(), record.day);
        let mut outcome = PutOutcome::Ignored;

        self.rewrite(
            &path,
            &RAW_DAILY_SCHEMA,
            frames::frame_to_raw,
            frames::raw_to_frame,
            || StoreError::WriteConflict {
                asset_id: asset_id.clone(),
                day,
            },
            |rows| {
                match rows.iter_mut().find(|r| r.key() == record.key()) {
                    Some(existing) if existing.fetched_at >= record.fetched_at => return false,
                    Some(existing) => {
                        *existing = record;
                        outcome = PutOutcome::Superseded;
                    }
                    None => {
                        rows.push(record);
                        outcome = PutOutcome::Inserted;
                    }
                }
                rows.sort_by(|a, b| a.key().cmp(&b.key()));
                true
            },
        )?;
        debug!(asset_id = %asset_id, day = %day, outcome = ?outcome, "stored raw record");
        Ok(outcome)
    }

    fn raw_records(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Vec<RawRecord>, StoreError> {
        let path = self.partition_path(RAW_DAILY, asset_id, day.year());
        if !path.exists() {
            return Ok(Vec::new());
        }
        let df = read_parquet(&path)?;
        RAW_DAILY_SCHEMA.validate(&df)?;
        Ok(frames::frame_to_raw(&df)?
            .into_iter()
            .filter(|r| r.day == day)
            .collect())
    }
}

impl CanonicalStore for ParquetStore {
    fn upsert(&self, record: CanonicalRecord) -> Result<(), StoreError> {
        self.require_asset(&record.asset_id)?;
        let path = self.partition_path(PRICES_DAILY, &record.asset_id, record.day.year());
        let (asset_id, day) = (record.asset_id.clone(), record.day);

        self.rewrite(
            &path,
            &PRICES_DAILY_SCHEMA,
            frames::frame_to_canonical,
            frames::canonical_to_frame,
            || StoreError::WriteConflict {
                asset_id: asset_id.clone(),
                day,
            },
            |rows| {
                match rows.iter_mut().find(|r| r.day == record.day) {
                    Some(existing) if *existing == record => return false,
                    Some(existing) => *existing = record,
                    None => rows.push(record),
                }
                rows.sort_by_key(|r| r.day);
                true
            },
        )?;
        debug!(asset_id = %asset_id, day = %day, "upserted canonical record");
        Ok(())
    }

    fn canonical(&self, asset_id: &AssetId, day: NaiveDate) -> Result<Option<CanonicalRecord>, StoreError> {
        let path = self.partition_path(PRICES_DAILY, asset_id, day.year());
        if !path.exists() {
            return Ok(None);
        }
        let df = read_parquet(&path)?;
        PRICES_DAILY_SCHEMA.validate(&df)?;
        Ok(frames::frame_to_canonical(&df)?
            .into_iter()
            .find(|r| r.day == day))
    }

    fn canonical_records(&self, asset_id: &AssetId) -> Result<Vec<CanonicalRecord>, StoreError> {
        let mut records = self.read_table(
            PRICES_DAILY,
            Some(asset_id),
            &PRICES_DAILY_SCHEMA,
            frames::frame_to_canonical,
        )?;
        records.sort_by_key(|r| r.day);
        Ok(records)
    }

    fn all_canonical(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        let mut records =
            self.read_table(PRICES_DAILY, None, &PRICES_DAILY_SCHEMA, frames::frame_to_canonical)?;
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(records)
    }
}

// ── file helpers ────────────────────────────────────────────────────

fn read_versions(root: &Path) -> Result<Option<SchemaVersions>, StoreError> {
    let path = root.join(SCHEMA_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_versions(root: &Path, versions: &SchemaVersions) -> Result<(), StoreError> {
    let path = root.join(SCHEMA_FILE);
    let tmp = tmp_path(&path);
    fs::write(&tmp, serde_json::to_string_pretty(versions)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn is_empty_store(root: &Path) -> bool {
    !root.join(ASSETS_FILE).exists()
        && !root.join(PRICES_DAILY).exists()
        && !root.join(RAW_DAILY).exists()
}

fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

fn file_digest(path: &Path) -> Result<Option<blake3::Hash>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(blake3::hash(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_parquet(path: &Path) -> Result<DataFrame, StoreError> {
    let file = fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<(), StoreError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

fn write_parquet_atomic(path: &Path, df: &mut DataFrame) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    write_parquet(&tmp, df)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::Io(e)
    })
}

/// `*.parquet` files under `dir`, recursively, in path order.
fn partition_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn table_files(root: &Path, table: &str) -> Result<Vec<PathBuf>, StoreError> {
    if table == ASSETS {
        let path = root.join(ASSETS_FILE);
        return Ok(if path.exists() { vec![path] } else { Vec::new() });
    }
    partition_files(&root.join(table))
}
