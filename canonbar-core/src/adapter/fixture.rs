//! Scripted in-memory source for tests and dry runs.
//!
//! Each `(asset, day)` has a script: a record, missing data, a data error,
//! transient failures, rate limiting or a granularity mismatch. Unscripted days behave as missing. Records carry a
//! fixed `fetched_at`, so repeated runs produce identical output.

use super::normalize::validate;
use super::{RecordStream, SourceAdapter};
use crate::domain::{Asset, AssetId, DayRange, Observation, RawRecord, SourceId};
use crate::error::FetchError;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixtureBar {
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub open: Option<f64>,
    pub close: Option<f64>,
}

impl FixtureBar {
    pub fn new(high: f64, low: f64, volume: f64) -> Self {
        Self {
            high,
            low,
            volume,
            open: None,
            close: None,
        }
    }

    pub fn with_open_close(mut self, open: f64, close: f64) -> Self {
        self.open = Some(open);
        self.close = Some(close);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DayScript {
    Record(FixtureBar),
    Missing,
    DataError(String),
    /// Fail transiently on the first `failures` fetches of the day, then succeed.
    TransientThen { failures: u32, bar: FixtureBar },
    AlwaysTransient,
    /// Every fetch is refused with HTTP 429 and this retry-after hint.
    RateLimited { retry_after_secs: u64 },
    /// The day's window cannot be assigned to one UTC day.
    GranularityMismatch,
}

type FetchHook = Box<dyn Fn(&AssetId, NaiveDate) + Send + Sync>;

pub struct FixtureAdapter {
    source: SourceId,
    scripts: HashMap<(AssetId, NaiveDate), DayScript>,
    fetched_at: DateTime<Utc>,
    latency: Duration,
    attempts: Mutex<HashMap<(AssetId, NaiveDate), u32>>,
    calls: Mutex<Vec<(AssetId, NaiveDate)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    on_fetch: Option<FetchHook>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl FixtureAdapter {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: SourceId::new(source),
            scripts: HashMap::new(),
            fetched_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().unwrap_or_default(),
            latency: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            on_fetch: None,
        }
    }

    pub fn script(mut self, asset_id: &str, day: NaiveDate, script: DayScript) -> Self {
        self.scripts.insert((AssetId::from(asset_id), day), script);
        self
    }

    /// Script the same response for every day of `range`.
    pub fn script_range(mut self, asset_id: &str, range: DayRange, script: DayScript) -> Self {
        for day in range.days() {
            self.scripts
                .insert((AssetId::from(asset_id), day), script.clone());
        }
        self
    }

    pub fn with_fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = at;
        self
    }

    /// Sleep this long per fetched day, to exercise concurrency limits.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Called at the start of every per-day fetch.
    pub fn on_fetch(mut self, hook: impl Fn(&AssetId, NaiveDate) + Send + Sync + 'static) -> Self {
        self.on_fetch = Some(Box::new(hook));
        self
    }

    /// Every `(asset, day)` fetched so far, in call order.
    pub fn calls(&self) -> Vec<(AssetId, NaiveDate)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Most per-day fetches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, asset_id: &AssetId, day: NaiveDate) -> Result<RawRecord, FetchError> {
        lock(&self.calls).push((asset_id.clone(), day));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(hook) = &self.on_fetch {
            hook(asset_id, day);
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let key = (asset_id.clone(), day);
        let attempt = {
            let mut attempts = lock(&self.attempts);
            let n = attempts.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let result = match self.scripts.get(&key) {
            None | Some(DayScript::Missing) => Err(FetchError::data_format(&self.source, day, "no data")),
            Some(DayScript::DataError(reason)) => {
                Err(FetchError::data_format(&self.source, day, reason.clone()))
            }
            Some(DayScript::AlwaysTransient) => Err(FetchError::transient(
                &self.source,
                format!("scripted outage (attempt {attempt})"),
            )),
            Some(DayScript::RateLimited { retry_after_secs }) => Err(FetchError::RateLimited {
                provider: self.source.clone(),
                retry_after_secs: *retry_after_secs,
            }),
            Some(DayScript::GranularityMismatch) => Err(FetchError::GranularityMismatch {
                reason: format!("{day}: window straddles two UTC days evenly"),
            }),
            Some(DayScript::TransientThen { failures, .. }) if attempt <= *failures => Err(
                FetchError::transient(&self.source, format!("scripted outage (attempt {attempt})")),
            ),
            Some(DayScript::TransientThen { bar, .. }) | Some(DayScript::Record(bar)) => {
                self.record(asset_id, day, bar)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn record(&self, asset_id: &AssetId, day: NaiveDate, bar: &FixtureBar) -> Result<RawRecord, FetchError> {
        let obs = Observation {
            timestamp: day.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).unwrap_or(self.fetched_at),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        };
        validate(&obs).map_err(|reason| FetchError::data_format(&self.source, day, reason))?;
        Ok(RawRecord {
            asset_id: asset_id.clone(),
            day,
            source: self.source.clone(),
            high: bar.high,
            low: bar.low,
            volume: bar.volume,
            open: bar.open,
            close: bar.close,
            fetched_at: self.fetched_at,
        })
    }
}

impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> &SourceId {
        &self.source
    }

    fn fetch(&self, asset: &Asset, range: DayRange) -> RecordStream<'_> {
        let asset_id = asset.asset_id.clone();
        Box::new(range.days().map(move |day| self.respond(&asset_id, day)))
    }
}
