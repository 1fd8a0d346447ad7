//! Record <-> DataFrame conversion for the Parquet tables.

use crate::domain::{Asset, AssetType, CanonicalRecord, RawRecord};
use crate::error::StoreError;
use crate::schema::{ASSETS, PRICES_DAILY, RAW_DAILY};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use polars::prelude::*;

fn epoch() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn day_number(day: NaiveDate) -> i32 {
    (day - epoch()).num_days() as i32
}

fn date_column(name: &str, days: Vec<i32>) -> PolarsResult<Column> {
    Column::new(name.into(), days).cast(&DataType::Date)
}

fn datetime_column(name: &str, millis: Vec<Option<i64>>) -> PolarsResult<Column> {
    Column::new(name.into(), millis).cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
}

fn list_column(name: &str, rows: Vec<Vec<&str>>) -> Column {
    if rows.is_empty() {
        return Column::from(Series::new_empty(
            name.into(),
            &DataType::List(Box::new(DataType::String)),
        ));
    }
    let inner: Vec<Series> = rows
        .into_iter()
        .map(|values| Series::new(PlSmallStr::EMPTY, values))
        .collect();
    Column::from(Series::new(name.into(), inner))
}

// ── writers ─────────────────────────────────────────────────────────

pub(crate) fn assets_to_frame(assets: &[Asset]) -> Result<DataFrame, StoreError> {
    let df = DataFrame::new(vec![
        Column::new(
            "asset_id".into(),
            assets.iter().map(|a| a.asset_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "symbol".into(),
            assets.iter().map(|a| a.symbol.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "asset_type".into(),
            assets.iter().map(|a| a.asset_type.as_str()).collect::<Vec<_>>(),
        ),
        datetime_column(
            "created_at",
            assets.iter().map(|a| Some(a.created_at.timestamp_millis())).collect(),
        )?,
        datetime_column(
            "deactivated_at",
            assets
                .iter()
                .map(|a| a.deactivated_at.map(|t| t.timestamp_millis()))
                .collect(),
        )?,
    ])?;
    Ok(df)
}

pub(crate) fn canonical_to_frame(records: &[CanonicalRecord]) -> Result<DataFrame, StoreError> {
    let df = DataFrame::new(vec![
        Column::new(
            "asset_id".into(),
            records.iter().map(|r| r.asset_id.as_str()).collect::<Vec<_>>(),
        ),
        date_column("day", records.iter().map(|r| day_number(r.day)).collect())?,
        Column::new("high".into(), records.iter().map(|r| r.high).collect::<Vec<_>>()),
        Column::new("low".into(), records.iter().map(|r| r.low).collect::<Vec<_>>()),
        Column::new("volume".into(), records.iter().map(|r| r.volume).collect::<Vec<_>>()),
        Column::new("open".into(), records.iter().map(|r| r.open).collect::<Vec<_>>()),
        Column::new("close".into(), records.iter().map(|r| r.close).collect::<Vec<_>>()),
        list_column(
            "contributing_sources",
            records
                .iter()
                .map(|r| r.contributing_sources.iter().map(|s| s.as_str()).collect())
                .collect(),
        ),
        datetime_column(
            "ingested_at",
            records.iter().map(|r| Some(r.ingested_at.timestamp_millis())).collect(),
        )?,
    ])?;
    Ok(df)
}

pub(crate) fn raw_to_frame(records: &[RawRecord]) -> Result<DataFrame, StoreError> {
    let df = DataFrame::new(vec![
        Column::new(
            "asset_id".into(),
            records.iter().map(|r| r.asset_id.as_str()).collect::<Vec<_>>(),
        ),
        date_column("day", records.iter().map(|r| day_number(r.day)).collect())?,
        Column::new(
            "source".into(),
            records.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
        ),
        Column::new("high".into(), records.iter().map(|r| r.high).collect::<Vec<_>>()),
        Column::new("low".into(), records.iter().map(|r| r.low).collect::<Vec<_>>()),
        Column::new("volume".into(), records.iter().map(|r| r.volume).collect::<Vec<_>>()),
        Column::new("open".into(), records.iter().map(|r| r.open).collect::<Vec<_>>()),
        Column::new("close".into(), records.iter().map(|r| r.close).collect::<Vec<_>>()),
        datetime_column(
            "fetched_at",
            records.iter().map(|r| Some(r.fetched_at.timestamp_millis())).collect(),
        )?,
    ])?;
    Ok(df)
}

// ── readers ─────────────────────────────────────────────────────────

struct Reader<'a> {
    df: &'a DataFrame,
    table: &'static str,
}

impl<'a> Reader<'a> {
    fn new(df: &'a DataFrame, table: &'static str) -> Self {
        Self { df, table }
    }

    fn has(&self, name: &str) -> bool {
        self.df.column(name).is_ok()
    }

    fn null_error(&self, name: &str, row: usize) -> StoreError {
        StoreError::SchemaMismatch {
            table: self.table.to_string(),
            reason: format!("null in required column '{name}' at row {row}"),
        }
    }

    fn strings(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let col = self.df.column(name)?;
        col.str()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.map(str::to_string).ok_or_else(|| self.null_error(name, i)))
            .collect()
    }

    fn floats(&self, name: &str) -> Result<Vec<f64>, StoreError> {
        self.optional_floats(name)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| self.null_error(name, i)))
            .collect()
    }

    /// An absent optional column reads as all nulls.
    fn optional_floats(&self, name: &str) -> Result<Vec<Option<f64>>, StoreError> {
        if !self.has(name) {
            return Ok(vec![None; self.df.height()]);
        }
        let col = self.df.column(name)?.cast(&DataType::Float64)?;
        Ok(col.f64()?.into_iter().collect())
    }

    fn dates(&self, name: &str) -> Result<Vec<NaiveDate>, StoreError> {
        let col = self.df.column(name)?.cast(&DataType::Int32)?;
        col.i32()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.map(|n| epoch() + Duration::days(n as i64))
                    .ok_or_else(|| self.null_error(name, i))
            })
            .collect()
    }

    fn optional_datetimes(&self, name: &str) -> Result<Vec<Option<DateTime<Utc>>>, StoreError> {
        if !self.has(name) {
            return Ok(vec![None; self.df.height()]);
        }
        let col = self
            .df
            .column(name)?
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
            .cast(&DataType::Int64)?;
        Ok(col
            .i64()?
            .into_iter()
            .map(|v| v.and_then(DateTime::from_timestamp_millis))
            .collect())
    }

    fn datetimes(&self, name: &str) -> Result<Vec<DateTime<Utc>>, StoreError> {
        self.optional_datetimes(name)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| self.null_error(name, i)))
            .collect()
    }

    fn string_lists(&self, name: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let lists = self.df.column(name)?.as_materialized_series().list()?.clone();
        let mut out = Vec::with_capacity(lists.len());
        for (i, row) in lists.into_iter().enumerate() {
            let row = row.ok_or_else(|| self.null_error(name, i))?;
            out.push(
                row.str()?
                    .into_iter()
                    .flatten()
                    .map(str::to_string)
                    .collect(),
            );
        }
        Ok(out)
    }
}

pub(crate) fn frame_to_assets(df: &DataFrame) -> Result<Vec<Asset>, StoreError> {
    let r = Reader::new(df, ASSETS);
    let ids = r.strings("asset_id")?;
    let symbols = r.strings("symbol")?;
    let types = r.strings("asset_type")?;
    let created = r.datetimes("created_at")?;
    let deactivated = r.optional_datetimes("deactivated_at")?;

    let mut out = Vec::with_capacity(ids.len());
    for i in 0..ids.len() {
        let asset_type: AssetType = types[i].parse().map_err(|reason| StoreError::SchemaMismatch {
            table: ASSETS.to_string(),
            reason,
        })?;
        out.push(Asset {
            asset_id: ids[i].as_str().into(),
            symbol: symbols[i].clone(),
            asset_type,
            created_at: created[i],
            deactivated_at: deactivated[i],
        });
    }
    Ok(out)
}

pub(crate) fn frame_to_canonical(df: &DataFrame) -> Result<Vec<CanonicalRecord>, StoreError> {
    let r = Reader::new(df, PRICES_DAILY);
    let ids = r.strings("asset_id")?;
    let days = r.dates("day")?;
    let highs = r.floats("high")?;
    let lows = r.floats("low")?;
    let volumes = r.floats("volume")?;
    let opens = r.optional_floats("open")?;
    let closes = r.optional_floats("close")?;
    let sources = r.string_lists("contributing_sources")?;
    let ingested = r.datetimes("ingested_at")?;

    Ok((0..ids.len())
        .map(|i| CanonicalRecord {
            asset_id: ids[i].as_str().into(),
            day: days[i],
            high: highs[i],
            low: lows[i],
            volume: volumes[i],
            open: opens[i],
            close: closes[i],
            contributing_sources: sources[i].iter().map(|s| s.as_str().into()).collect(),
            ingested_at: ingested[i],
        })
        .collect())
}

pub(crate) fn frame_to_raw(df: &DataFrame) -> Result<Vec<RawRecord>, StoreError> {
    let r = Reader::new(df, RAW_DAILY);
    let ids = r.strings("asset_id")?;
    let days = r.dates("day")?;
    let sources = r.strings("source")?;
    let highs = r.floats("high")?;
    let lows = r.floats("low")?;
    let volumes = r.floats("volume")?;
    let opens = r.optional_floats("open")?;
    let closes = r.optional_floats("close")?;
    let fetched = r.datetimes("fetched_at")?;

    Ok((0..ids.len())
        .map(|i| RawRecord {
            asset_id: ids[i].as_str().into(),
            day: days[i],
            source: sources[i].as_str().into(),
            high: highs[i],
            low: lows[i],
            volume: volumes[i],
            open: opens[i],
            close: closes[i],
            fetched_at: fetched[i],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ASSETS_SCHEMA, PRICES_DAILY_SCHEMA, RAW_DAILY_SCHEMA};
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
    }

    #[test]
    fn canonical_frame_matches_schema_and_reads_back() {
        let rec = CanonicalRecord {
            asset_id: "btc".into(),
            day: NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
            high: 10.0,
            low: 9.0,
            volume: 100.0,
            open: Some(9.5),
            close: None,
            contributing_sources: BTreeSet::from(["binance".into(), "coinbase".into()]),
            ingested_at: at(),
        };
        let df = canonical_to_frame(std::slice::from_ref(&rec)).unwrap();
        PRICES_DAILY_SCHEMA.validate(&df).unwrap();
        assert_eq!(frame_to_canonical(&df).unwrap(), vec![rec]);
    }

    #[test]
    fn raw_frame_without_optional_columns_reads_nulls() {
        let rec = RawRecord {
            asset_id: "btc".into(),
            day: NaiveDate::from_ymd_opt(1969, 12, 31).unwrap(),
            source: "kraken".into(),
            high: 1.0,
            low: 0.5,
            volume: 3.0,
            open: Some(0.7),
            close: Some(0.9),
            fetched_at: at(),
        };
        let df = raw_to_frame(std::slice::from_ref(&rec)).unwrap();
        RAW_DAILY_SCHEMA.validate(&df).unwrap();

        let trimmed = df.drop("open").unwrap().drop("close").unwrap();
        let back = frame_to_raw(&trimmed).unwrap();
        assert_eq!(back[0].day, rec.day);
        assert_eq!(back[0].open, None);
        assert_eq!(back[0].close, None);
    }

    #[test]
    fn asset_frame_keeps_deactivation() {
        let mut asset = Asset::new("eth", "ETH", AssetType::Token, at());
        asset.deactivated_at = Some(at());
        let active = Asset::new("btc", "BTC", AssetType::Coin, at());
        let df = assets_to_frame(&[active.clone(), asset.clone()]).unwrap();
        ASSETS_SCHEMA.validate(&df).unwrap();
        assert_eq!(frame_to_assets(&df).unwrap(), vec![active, asset]);
    }
}
