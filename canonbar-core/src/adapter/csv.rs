//! CSV file source: `{dir}/{symbol}.csv` with header
//! `timestamp,open,high,low,close,volume`.
//!
//! Timestamps may be RFC 3339, epoch seconds, `YYYY-MM-DD` or
//! `YYYY-MM-DD HH:MM:SS`. Naive forms are local to the source and shifted by
//! `utc_offset_secs`. `open` and `close` may be empty.

use super::normalize::{fetch_time, records_for_page};
use super::{PagedStream, RecordStream, SourceAdapter};
use crate::align::Granularity;
use crate::config::{ConfigError, SourceConfig};
use crate::domain::{Asset, DayRange, Observation, SourceId};
use crate::error::FetchError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    #[serde(default)]
    open: Option<f64>,
    high: f64,
    low: f64,
    #[serde(default)]
    close: Option<f64>,
    volume: f64,
}

pub struct CsvAdapter {
    source: SourceId,
    dir: PathBuf,
    symbol_template: String,
    granularity: Granularity,
    utc_offset: Duration,
}

impl CsvAdapter {
    pub fn new(source: impl Into<String>, dir: impl Into<PathBuf>, granularity: Granularity) -> Self {
        Self {
            source: SourceId::new(source),
            dir: dir.into(),
            symbol_template: "{symbol}".to_string(),
            granularity,
            utc_offset: Duration::zero(),
        }
    }

    pub fn with_utc_offset(mut self, offset_secs: i32) -> Self {
        self.utc_offset = Duration::seconds(offset_secs as i64);
        self
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let dir = config.dir.clone().ok_or_else(|| ConfigError::Invalid {
            field: "sources.dir".to_string(),
            reason: format!("csv source '{}' needs a dir", config.name),
        })?;
        Ok(Self {
            source: config.name.clone(),
            dir,
            symbol_template: config.symbol_template.clone(),
            granularity: Granularity::from_secs(config.granularity_secs),
            utc_offset: Duration::seconds(config.utc_offset_secs as i64),
        })
    }

    pub fn path_for(&self, asset: &Asset) -> PathBuf {
        let symbol = self.symbol_template.replace("{symbol}", &asset.symbol);
        self.dir.join(format!("{symbol}.csv"))
    }

    /// Observations whose window starts within a day of `range`.
    fn read_observations(&self, path: &Path, range: DayRange) -> Result<Vec<Observation>, String> {
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(::csv::Trim::All)
            .from_path(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;

        let lo = range.start().pred_opt().unwrap_or(range.start());
        let hi = range.end().succ_opt().unwrap_or(range.end());
        let mut out = Vec::new();
        let mut skipped = 0usize;

        for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
            let parsed = row
                .map_err(|e| e.to_string())
                .and_then(|r| self.to_observation(r));
            match parsed {
                Ok(obs) => {
                    let day = obs.timestamp.date_naive();
                    if lo <= day && day <= hi {
                        out.push(obs);
                    }
                }
                Err(e) => {
                    skipped += 1;
                    if skipped == 1 {
                        warn!(source = %self.source, path = %path.display(), line = line + 2, error = %e, "skipping malformed csv row");
                    }
                }
            }
        }
        if skipped > 1 {
            warn!(source = %self.source, path = %path.display(), skipped, "skipped malformed csv rows");
        }
        Ok(out)
    }

    fn to_observation(&self, row: CsvRow) -> Result<Observation, String> {
        Ok(Observation {
            timestamp: parse_timestamp(&row.timestamp, self.utc_offset)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        })
    }
}

/// Parse a CSV timestamp to UTC. Naive forms are shifted back by `offset`.
pub fn parse_timestamp(raw: &str, offset: Duration) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if !raw.is_empty() && raw.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = raw.parse().map_err(|e| format!("bad epoch '{raw}': {e}"))?;
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("epoch out of range: {raw}"));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| format!("unrecognized timestamp '{raw}'"))?;
    Ok((naive - offset).and_utc())
}

impl SourceAdapter for CsvAdapter {
    fn source(&self) -> &SourceId {
        &self.source
    }

    fn fetch(&self, asset: &Asset, range: DayRange) -> RecordStream<'_> {
        let path = self.path_for(asset);
        let asset_id = asset.asset_id.clone();
        Box::new(PagedStream::new(range, range.len(), move |page| {
            match self.read_observations(&path, page) {
                Ok(observations) => records_for_page(
                    &asset_id,
                    &self.source,
                    page,
                    observations,
                    self.granularity,
                    fetch_time(),
                ),
                Err(reason) => page
                    .days()
                    .map(|day| Err(FetchError::data_format(&self.source, day, reason.clone())))
                    .collect(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetType;
    use chrono::TimeZone;

    fn d(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    #[test]
    fn timestamp_forms() {
        let midnight = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T00:00:00Z", Duration::zero()), Ok(midnight));
        assert_eq!(parse_timestamp("1704153600", Duration::zero()), Ok(midnight));
        assert_eq!(parse_timestamp("2024-01-02", Duration::zero()), Ok(midnight));
        // local midnight at UTC+8 is 16:00 UTC the day before
        assert_eq!(
            parse_timestamp("2024-01-02 00:00:00", Duration::hours(8)),
            Ok(Utc.with_ymd_and_hms(2024, 1, 1, 16, 0, 0).unwrap())
        );
        assert!(parse_timestamp("yesterday", Duration::zero()).is_err());
    }

    #[test]
    fn missing_file_is_a_data_error_for_each_day() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CsvAdapter::new("archive", dir.path(), Granularity::Daily);
        let asset = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
        let out: Vec<_> = adapter
            .fetch(&asset, DayRange::new(d(1), d(2)).unwrap())
            .collect();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.as_ref().is_err_and(|e| !e.is_retryable())));
    }

    #[test]
    fn hourly_rows_fold_into_days() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("BTC.csv"),
            "timestamp,open,high,low,close,volume\n\
             2024-01-01T00:00:00Z,10,12,9,11,1\n\
             2024-01-01T01:00:00Z,11,15,10,14,2\n\
             2024-01-02T00:00:00Z,14,,13,,5\n\
             garbage,1,1,1,1,1\n",
        )
        .unwrap();
        let adapter = CsvAdapter::new("archive", dir.path(), Granularity::Hours(1));
        let asset = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
        let out: Vec<_> = adapter
            .fetch(&asset, DayRange::new(d(1), d(2)).unwrap())
            .collect();

        let day1 = out[0].as_ref().unwrap();
        assert_eq!(day1.high, 15.0);
        assert_eq!(day1.low, 9.0);
        assert_eq!(day1.volume, 3.0);
        assert_eq!(day1.close, Some(14.0));
        // high column empty on Jan 2: the row is malformed and skipped
        assert!(out[1].is_err());
    }
}
