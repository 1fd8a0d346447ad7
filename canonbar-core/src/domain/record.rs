use super::ids::{AssetId, DayKey, SourceId, TaskKey};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single provider observation before it is assigned to a UTC day.
///
/// `timestamp` is the start of the observation window, already converted to UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: f64,
    pub low: f64,
    pub close: Option<f64>,
    pub volume: f64,
}

/// One source's report for one asset on one UTC day.
///
/// Immutable once stored. A newer fetch (later `fetched_at`) for the same
/// `(asset_id, day, source)` replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub asset_id: AssetId,
    pub day: NaiveDate,
    pub source: SourceId,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.asset_id.clone(), self.day, self.source.clone())
    }

    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.asset_id.clone(), self.day)
    }
}

/// Reconciled truth for `(asset_id, day)`: one row of `prices_daily`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub asset_id: AssetId,
    pub day: NaiveDate,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    pub contributing_sources: BTreeSet<SourceId>,
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn key(&self) -> DayKey {
        DayKey::new(self.asset_id.clone(), self.day)
    }
}
