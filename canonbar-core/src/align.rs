//! Time alignment: provider observations onto canonical UTC day buckets.
//!
//! An observation covers the window `[timestamp, timestamp + granularity)`.
//! Assignment rule:
//! - window inside one UTC day: that day
//! - window crossing midnight: the day holding strictly more than half of it
//! - exact half/half split, zero-length or longer-than-a-day windows: rejected
//!   with a granularity mismatch, never guessed

use crate::domain::{AssetId, Observation, RawRecord, SourceId};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlignError {
    #[error("granularity mismatch: {0}")]
    GranularityMismatch(String),
}

impl From<AlignError> for crate::error::FetchError {
    fn from(e: AlignError) -> Self {
        match e {
            AlignError::GranularityMismatch(reason) => {
                crate::error::FetchError::GranularityMismatch { reason }
            }
        }
    }
}

/// Time resolution of a provider's observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", content = "n", rename_all = "snake_case")]
pub enum Granularity {
    Seconds(u32),
    Minutes(u32),
    Hours(u32),
    Daily,
}

impl Granularity {
    pub fn from_secs(secs: u32) -> Self {
        match secs {
            86_400 => Granularity::Daily,
            s if s % 3600 == 0 => Granularity::Hours(s / 3600),
            s if s % 60 == 0 => Granularity::Minutes(s / 60),
            s => Granularity::Seconds(s),
        }
    }

    pub fn seconds(&self) -> i64 {
        match *self {
            Granularity::Seconds(n) => n as i64,
            Granularity::Minutes(n) => n as i64 * 60,
            Granularity::Hours(n) => n as i64 * 3600,
            Granularity::Daily => SECS_PER_DAY,
        }
    }
}

/// Assign an observation window starting at `timestamp` to its UTC day.
pub fn align(timestamp: DateTime<Utc>, granularity: Granularity) -> Result<NaiveDate, AlignError> {
    let len = granularity.seconds();
    if len <= 0 {
        return Err(AlignError::GranularityMismatch(format!(
            "zero-length window at {timestamp}"
        )));
    }
    if len > SECS_PER_DAY {
        return Err(AlignError::GranularityMismatch(format!(
            "window of {len}s at {timestamp} is longer than a day"
        )));
    }

    let day = timestamp.date_naive();
    let next_day = day.succ_opt().ok_or_else(|| {
        AlignError::GranularityMismatch(format!("timestamp {timestamp} out of range"))
    })?;
    let midnight = next_day.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).ok_or_else(|| {
        AlignError::GranularityMismatch(format!("no midnight after {timestamp}"))
    })?;
    let end = timestamp + Duration::seconds(len);

    if end <= midnight {
        return Ok(day);
    }

    let before = (midnight - timestamp).num_seconds();
    let after = (end - midnight).num_seconds();
    match before.cmp(&after) {
        std::cmp::Ordering::Greater => Ok(day),
        std::cmp::Ordering::Less => Ok(next_day),
        std::cmp::Ordering::Equal => Err(AlignError::GranularityMismatch(format!(
            "window {timestamp} +{len}s splits evenly across {day} and {next_day}"
        ))),
    }
}

/// Observations grouped by UTC day, with the ones that could not be assigned.
#[derive(Debug, Default)]
pub struct Bucketed {
    pub days: BTreeMap<NaiveDate, Vec<Observation>>,
    pub rejected: Vec<(Observation, AlignError)>,
}

pub fn bucket(observations: Vec<Observation>, granularity: Granularity) -> Bucketed {
    let mut out = Bucketed::default();
    for obs in observations {
        match align(obs.timestamp, granularity) {
            Ok(day) => out.days.entry(day).or_default().push(obs),
            Err(e) => out.rejected.push((obs, e)),
        }
    }
    out
}

/// Fold one day's observations into a single raw record.
///
/// high = max, low = min, volume = sum, open = first, close = last
/// (ordered by window start). Returns `None` for an empty slice.
pub fn aggregate_daily(
    asset_id: &AssetId,
    source: &SourceId,
    day: NaiveDate,
    observations: &[Observation],
    fetched_at: DateTime<Utc>,
) -> Option<RawRecord> {
    let mut sorted: Vec<&Observation> = observations.iter().collect();
    sorted.sort_by_key(|o| o.timestamp);
    let first = sorted.first()?;
    let last = sorted.last()?;

    let high = sorted.iter().map(|o| o.high).fold(f64::NEG_INFINITY, f64::max);
    let low = sorted.iter().map(|o| o.low).fold(f64::INFINITY, f64::min);
    let volume = sorted.iter().map(|o| o.volume).sum();

    Some(RawRecord {
        asset_id: asset_id.clone(),
        day,
        source: source.clone(),
        high,
        low,
        volume,
        open: first.open,
        close: last.close,
        fetched_at,
    })
}
