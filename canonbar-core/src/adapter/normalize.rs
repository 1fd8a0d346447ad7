//! Shared normalization: validation of provider values and folding of
//! observations into per-day raw records.

use crate::align::{aggregate_daily, bucket, Granularity};
use crate::domain::{AssetId, DayRange, Observation, RawRecord, SourceId};
use crate::error::FetchError;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Reject values no exchange can report.
///
/// Prices and volume must be finite and non-negative, `high >= low`, and
/// `open`/`close` (when present) must lie within `[low, high]`.
pub fn validate(obs: &Observation) -> Result<(), String> {
    let named = [
        ("high", Some(obs.high)),
        ("low", Some(obs.low)),
        ("volume", Some(obs.volume)),
        ("open", obs.open),
        ("close", obs.close),
    ];
    for (name, value) in named {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(format!("{name} is not finite"));
            }
            if v < 0.0 {
                return Err(format!("{name} is negative ({v})"));
            }
        }
    }
    if obs.high < obs.low {
        return Err(format!("high {} below low {}", obs.high, obs.low));
    }
    for (name, value) in [("open", obs.open), ("close", obs.close)] {
        if let Some(v) = value {
            if v < obs.low || v > obs.high {
                return Err(format!("{name} {v} outside [{}, {}]", obs.low, obs.high));
            }
        }
    }
    Ok(())
}

/// Turn one page of observations into one result per day of `page`.
///
/// Days with no observation yield a `DataFormat` error for that day, as do
/// days holding an invalid observation. Observations that cannot be aligned
/// yield a `GranularityMismatch` each. Observations landing outside the page
/// are dropped.
pub(crate) fn records_for_page(
    asset_id: &AssetId,
    source: &SourceId,
    page: DayRange,
    observations: Vec<Observation>,
    granularity: Granularity,
    fetched_at: DateTime<Utc>,
) -> Vec<Result<RawRecord, FetchError>> {
    let mut bucketed = bucket(observations, granularity);
    let mut out = Vec::with_capacity(page.len());

    for (obs, err) in bucketed.rejected {
        warn!(source = %source, asset_id = %asset_id, timestamp = %obs.timestamp, error = %err, "rejected observation");
        out.push(Err(err.into()));
    }

    let outside = bucketed.days.keys().filter(|d| !page.contains(**d)).count();
    if outside > 0 {
        debug!(source = %source, asset_id = %asset_id, outside, "dropping observations outside requested page");
    }

    for day in page.days() {
        let result = match bucketed.days.remove(&day) {
            None => Err(FetchError::data_format(source, day, "no data")),
            Some(obs) => match obs.iter().find_map(|o| validate(o).err()) {
                Some(reason) => Err(FetchError::data_format(source, day, reason)),
                None => aggregate_daily(asset_id, source, day, &obs, fetched_at)
                    .ok_or_else(|| FetchError::data_format(source, day, "no data")),
            },
        };
        out.push(result);
    }
    out
}

/// Current time truncated to whole milliseconds, the precision of the store.
pub(crate) fn fetch_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
