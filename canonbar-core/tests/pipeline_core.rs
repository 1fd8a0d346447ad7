//! Adapters, reconciler and store wired together without the orchestrator.

use canonbar_core::adapter::{build_adapters, DayScript, FixtureAdapter, FixtureBar, SourceAdapter};
use canonbar_core::config::PipelineConfig;
use canonbar_core::domain::{Asset, AssetType, DayRange, RawRecord};
use canonbar_core::reconcile::Reconciler;
use canonbar_core::review::{MemoryReviewQueue, ReviewSink};
use canonbar_core::store::{CanonicalStore, CanonicalWriter, MemoryStore, RawStore};
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;

fn d(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, n).unwrap()
}

#[test]
fn csv_and_fixture_sources_reconcile_into_canonical_records() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("BTC.csv"),
        "timestamp,open,high,low,close,volume\n\
         2024-03-01,61000,62000,60000,61500,100\n\
         2024-03-02,61500,64000,61000,63000,120\n",
    )
    .unwrap();

    let config = PipelineConfig::from_toml(&format!(
        r#"
[reconcile]
source_priority = ["archive", "replica"]
discrepancy_tolerance = 0.02

[[sources]]
name = "archive"
format = "csv"
dir = "{}"
"#,
        dir.path().display().to_string().replace('\\', "/")
    ))
    .unwrap();

    let mut adapters = build_adapters(&config).unwrap();
    adapters.push(std::sync::Arc::new(
        FixtureAdapter::new("replica")
            .script("btc", d(1), DayScript::Record(FixtureBar::new(62_100.0, 60_050.0, 90.0)))
            .script("btc", d(2), DayScript::Record(FixtureBar::new(70_000.0, 61_000.0, 80.0))),
    ));

    let asset = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
    let store = MemoryStore::with_assets([asset.clone()]).unwrap();
    let range = DayRange::new(d(1), d(2)).unwrap();

    for adapter in &adapters {
        for rec in adapter.fetch(&asset, range) {
            store.put_raw(rec.unwrap()).unwrap();
        }
    }

    let reconciler = Reconciler::from_config(&config.reconcile);
    let review = MemoryReviewQueue::new();
    let writer = CanonicalWriter::new(&store, config.retry);
    for day in range.days() {
        let raws: Vec<RawRecord> = store.raw_records(&asset.asset_id, day).unwrap();
        let merged = reconciler.reconcile(&asset.asset_id, day, &raws).unwrap();
        for flag in &merged.flags {
            review.submit(flag).unwrap();
        }
        writer.write(&merged.record).unwrap();
    }

    let canon: BTreeMap<NaiveDate, _> = store
        .canonical_records(&asset.asset_id)
        .unwrap()
        .into_iter()
        .map(|r| (r.day, r))
        .collect();
    assert_eq!(canon.len(), 2);
    // archive is primary on both days
    assert_eq!(canon[&d(1)].high, 62_000.0);
    assert_eq!(canon[&d(2)].close, Some(63_000.0));
    assert_eq!(canon[&d(2)].contributing_sources.len(), 2);

    // replica's high on day 2 is ~9% off; day 1 is within tolerance
    let flags = review.flags();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].day, d(2));
}
