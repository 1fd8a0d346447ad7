//! Criterion benchmarks for the per-day hot paths.
//!
//! 1. Reconciliation of one day across several sources
//! 2. Intraday bucketing and daily aggregation
//! 3. Memory store upsert + snapshot hash

use canonbar_core::align::{aggregate_daily, bucket, Granularity};
use canonbar_core::domain::{
    Asset, AssetId, AssetType, CanonicalRecord, Observation, RawRecord, SourceId,
};
use canonbar_core::reconcile::{Reconciler, SourcePriority};
use canonbar_core::store::{CanonicalStore, MemoryStore};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
}

fn make_raw(sources: usize) -> Vec<RawRecord> {
    (0..sources)
        .map(|i| {
            let base = 100.0 + i as f64 * 0.5;
            RawRecord {
                asset_id: AssetId::from("btc"),
                day: day(),
                source: SourceId::new(format!("source{i}")),
                high: base + 2.0,
                low: base - 2.0,
                volume: 1_000.0,
                open: Some(base),
                close: Some(base + 1.0),
                fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 0, i as u32, 0).unwrap(),
            }
        })
        .collect()
}

fn make_hourly(n: usize) -> Vec<Observation> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let mid = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            Observation {
                timestamp: start + Duration::hours(i as i64),
                open: Some(mid),
                high: mid + 1.0,
                low: mid - 1.0,
                close: Some(mid + 0.5),
                volume: 10.0,
            }
        })
        .collect()
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    let priority = SourcePriority::new(vec![SourceId::from("source2"), SourceId::from("source0")]);
    let reconciler = Reconciler::new(priority, 0.005);
    for n in [2usize, 4, 8] {
        let records = make_raw(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &records, |b, records| {
            b.iter(|| reconciler.reconcile(&AssetId::from("btc"), day(), black_box(records)))
        });
    }
    group.finish();
}

fn bench_align(c: &mut Criterion) {
    let observations = make_hourly(24 * 365);
    c.bench_function("bucket_hourly_year", |b| {
        b.iter(|| bucket(black_box(observations.clone()), Granularity::Hours(1)))
    });

    let day_obs = make_hourly(24);
    let asset = AssetId::from("btc");
    let source = SourceId::from("binance");
    let at = Utc::now();
    c.bench_function("aggregate_daily_24h", |b| {
        b.iter(|| aggregate_daily(&asset, &source, day(), black_box(&day_obs), at))
    });
}

fn bench_store(c: &mut Criterion) {
    let store = MemoryStore::with_assets([Asset::new("btc", "BTC", AssetType::Coin, Utc::now())])
        .unwrap();
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    let sources: BTreeSet<SourceId> = [SourceId::from("binance")].into_iter().collect();
    let records: Vec<CanonicalRecord> = (0..1_000)
        .map(|i| CanonicalRecord {
            asset_id: AssetId::from("btc"),
            day: start + Duration::days(i),
            high: 10.0,
            low: 9.0,
            volume: 1.0,
            open: None,
            close: None,
            contributing_sources: sources.clone(),
            ingested_at: Utc::now(),
        })
        .collect();

    c.bench_function("memory_upsert_1000", |b| {
        b.iter(|| {
            for rec in &records {
                store.upsert(rec.clone()).unwrap();
            }
        })
    });
    c.bench_function("snapshot_hash_1000", |b| b.iter(|| store.snapshot_hash().unwrap()));
}

criterion_group!(benches, bench_reconcile, bench_align, bench_store);
criterion_main!(benches);
