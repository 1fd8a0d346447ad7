//! On-disk store lifecycle: legacy layouts, migration, reopen.

use canonbar_core::domain::{Asset, AssetId, AssetType, SourceId};
use canonbar_core::error::StoreError;
use canonbar_core::store::{AssetRegistry, CanonicalStore, ParquetStore};
use chrono::{NaiveDate, Utc};
use polars::prelude::*;
use std::path::Path;

fn day_number(day: NaiveDate) -> i32 {
    (day - NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()).num_days() as i32
}

/// A `prices_daily` partition as version 1 wrote it: sources comma-joined.
fn write_v1_partition(root: &Path) {
    let days = [
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
    ];
    let mut df = DataFrame::new(vec![
        Column::new("asset_id".into(), &["btc", "btc"]),
        Column::new("day".into(), days.iter().map(|d| day_number(*d)).collect::<Vec<_>>())
            .cast(&DataType::Date)
            .unwrap(),
        Column::new("high".into(), &[42_000.0, 43_000.0]),
        Column::new("low".into(), &[41_000.0, 42_500.0]),
        Column::new("volume".into(), &[10.0, 12.0]),
        Column::new("contributing_sources".into(), &["binance,coinbase", "kraken"]),
        Column::new("ingested_at".into(), &[1_704_153_600_000i64, 1_704_240_000_000])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap(),
    ])
    .unwrap();

    let dir = root.join("prices_daily").join("asset_id=btc");
    std::fs::create_dir_all(&dir).unwrap();
    let file = std::fs::File::create(dir.join("2024.parquet")).unwrap();
    ParquetWriter::new(file).finish(&mut df).unwrap();
}

#[test]
fn outdated_store_must_be_migrated_before_open() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_partition(dir.path());
    std::fs::write(
        dir.path().join("schema.json"),
        r#"{"assets":1,"prices_daily":1,"raw_daily":1}"#,
    )
    .unwrap();

    match ParquetStore::open(dir.path()) {
        Err(StoreError::MigrationRequired {
            table,
            found,
            current,
        }) => {
            assert_eq!(table, "prices_daily");
            assert_eq!(found, 1);
            assert_eq!(current, 2);
        }
        Err(other) => panic!("expected MigrationRequired, got {other}"),
        Ok(_) => panic!("expected MigrationRequired, store opened"),
    }

    let status = ParquetStore::status(dir.path()).unwrap();
    assert_eq!(status.price_partitions, 1);
    assert_eq!(status.outdated, vec![("prices_daily".to_string(), 1, 2)]);

    let outcomes = ParquetStore::migrate(dir.path()).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].files_rewritten, 1);

    let store = ParquetStore::open(dir.path()).unwrap();
    let records = store.canonical_records(&AssetId::from("btc")).unwrap();
    assert_eq!(records.len(), 2);
    let first: Vec<&str> = records[0]
        .contributing_sources
        .iter()
        .map(SourceId::as_str)
        .collect();
    assert_eq!(first, vec!["binance", "coinbase"]);
    assert_eq!(records[1].high, 43_000.0);
    assert_eq!(records[0].open, None);

    // nothing left to do
    assert!(ParquetStore::migrate(dir.path()).unwrap().is_empty());
}

#[test]
fn data_without_schema_file_is_treated_as_version_one() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_partition(dir.path());

    assert!(matches!(
        ParquetStore::open(dir.path()),
        Err(StoreError::MigrationRequired { .. })
    ));
    ParquetStore::migrate(dir.path()).unwrap();

    let store = ParquetStore::open(dir.path()).unwrap();
    store
        .register(Asset::new("btc", "BTC", AssetType::Coin, Utc::now()))
        .unwrap();
    assert_eq!(store.all_canonical().unwrap().len(), 2);
    assert!(!store.snapshot_hash().unwrap().is_empty());
}
