//! Versioned table schemas for the canonical store.
//!
//! A frame satisfies a schema when every required column is present with the
//! declared type. Extra columns and absent optional columns are accepted, so
//! adding an optional column never needs a migration. Removing or retyping a
//! column bumps the table version and requires a registered migration
//! (see [`crate::migration`]).

use crate::error::StoreError;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ASSETS: &str = "assets";
pub const PRICES_DAILY: &str = "prices_daily";
pub const RAW_DAILY: &str = "raw_daily";

/// Logical column type, mapped onto a polars dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Float64,
    Date,
    /// UTC datetime, millisecond precision on write.
    Datetime,
    Utf8List,
}

impl ColumnType {
    pub fn to_polars(self) -> DataType {
        match self {
            ColumnType::Utf8 => DataType::String,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Date => DataType::Date,
            ColumnType::Datetime => DataType::Datetime(TimeUnit::Milliseconds, None),
            ColumnType::Utf8List => DataType::List(Box::new(DataType::String)),
        }
    }

    /// Datetimes match regardless of time unit.
    pub fn matches(self, dtype: &DataType) -> bool {
        match self {
            ColumnType::Datetime => matches!(dtype, DataType::Datetime(_, _)),
            other => &other.to_polars() == dtype,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub dtype: ColumnType,
    pub required: bool,
}

const fn req(name: &'static str, dtype: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        dtype,
        required: true,
    }
}

const fn opt(name: &'static str, dtype: ColumnType) -> ColumnSpec {
    ColumnSpec {
        name,
        dtype,
        required: false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub version: u32,
    pub columns: &'static [ColumnSpec],
}

const ASSETS_COLUMNS: &[ColumnSpec] = &[
    req("asset_id", ColumnType::Utf8),
    req("symbol", ColumnType::Utf8),
    req("asset_type", ColumnType::Utf8),
    req("created_at", ColumnType::Datetime),
    opt("deactivated_at", ColumnType::Datetime),
];

const PRICES_DAILY_COLUMNS: &[ColumnSpec] = &[
    req("asset_id", ColumnType::Utf8),
    req("day", ColumnType::Date),
    req("high", ColumnType::Float64),
    req("low", ColumnType::Float64),
    req("volume", ColumnType::Float64),
    opt("open", ColumnType::Float64),
    opt("close", ColumnType::Float64),
    req("contributing_sources", ColumnType::Utf8List),
    req("ingested_at", ColumnType::Datetime),
];

const RAW_DAILY_COLUMNS: &[ColumnSpec] = &[
    req("asset_id", ColumnType::Utf8),
    req("day", ColumnType::Date),
    req("source", ColumnType::Utf8),
    req("high", ColumnType::Float64),
    req("low", ColumnType::Float64),
    req("volume", ColumnType::Float64),
    opt("open", ColumnType::Float64),
    opt("close", ColumnType::Float64),
    req("fetched_at", ColumnType::Datetime),
];

pub const ASSETS_SCHEMA: TableSchema = TableSchema {
    name: ASSETS,
    version: 1,
    columns: ASSETS_COLUMNS,
};

pub const PRICES_DAILY_SCHEMA: TableSchema = TableSchema {
    name: PRICES_DAILY,
    version: 2,
    columns: PRICES_DAILY_COLUMNS,
};

pub const RAW_DAILY_SCHEMA: TableSchema = TableSchema {
    name: RAW_DAILY,
    version: 1,
    columns: RAW_DAILY_COLUMNS,
};

pub const ALL_TABLES: [&TableSchema; 3] = [&ASSETS_SCHEMA, &PRICES_DAILY_SCHEMA, &RAW_DAILY_SCHEMA];

pub fn current(table: &str) -> Option<&'static TableSchema> {
    ALL_TABLES.iter().copied().find(|t| t.name == table)
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check a frame against this schema.
    pub fn validate(&self, df: &DataFrame) -> Result<(), StoreError> {
        let actual = df.schema();
        for col in self.columns {
            match actual.get(col.name) {
                None if col.required => {
                    return Err(self.mismatch(format!("missing required column '{}'", col.name)))
                }
                None => {}
                Some(dtype) if !col.dtype.matches(dtype) => {
                    return Err(self.mismatch(format!(
                        "column '{}' expected {:?}, got {dtype:?}",
                        col.name,
                        col.dtype.to_polars()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn mismatch(&self, reason: String) -> StoreError {
        StoreError::SchemaMismatch {
            table: self.name.to_string(),
            reason,
        }
    }
}

/// Contents of `schema.json`: table name to stored version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersions(pub BTreeMap<String, u32>);

impl SchemaVersions {
    /// Versions of a freshly created store.
    pub fn current() -> Self {
        Self(
            ALL_TABLES
                .iter()
                .map(|t| (t.name.to_string(), t.version))
                .collect(),
        )
    }

    /// Stored version of `table`; a table absent from the file is treated as v1.
    pub fn get(&self, table: &str) -> u32 {
        self.0.get(table).copied().unwrap_or(1)
    }

    pub fn set(&mut self, table: &str, version: u32) {
        self.0.insert(table.to_string(), version);
    }

    /// Tables stored below their current version: (schema, found).
    pub fn outdated(&self) -> Vec<(&'static TableSchema, u32)> {
        ALL_TABLES
            .iter()
            .copied()
            .filter_map(|t| {
                let found = self.get(t.name);
                (found < t.version).then_some((t, found))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> Column {
        Column::new("ingested_at".into(), &[v])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap()
    }

    fn prices_frame(with_optional: bool) -> DataFrame {
        let sources = Series::new(
            "contributing_sources".into(),
            &[Series::new("".into(), &["binance"])],
        );
        let mut cols = vec![
            Column::new("asset_id".into(), &["btc"]),
            Column::new("day".into(), &[19_700i32]).cast(&DataType::Date).unwrap(),
            Column::new("high".into(), &[10.0]),
            Column::new("low".into(), &[9.0]),
            Column::new("volume".into(), &[1.0]),
            Column::from(sources),
            ms(1_700_000_000_000),
        ];
        if with_optional {
            cols.push(Column::new("open".into(), &[Some(9.5)]));
            cols.push(Column::new("close".into(), &[None::<f64>]));
        }
        DataFrame::new(cols).unwrap()
    }

    #[test]
    fn accepts_missing_optional_columns() {
        PRICES_DAILY_SCHEMA.validate(&prices_frame(false)).unwrap();
        PRICES_DAILY_SCHEMA.validate(&prices_frame(true)).unwrap();
    }

    #[test]
    fn accepts_extra_columns() {
        let mut df = prices_frame(false);
        df.with_column(Column::new("vwap".into(), &[9.7])).unwrap();
        PRICES_DAILY_SCHEMA.validate(&df).unwrap();
    }

    #[test]
    fn rejects_missing_required_column() {
        let df = prices_frame(false).drop("high").unwrap();
        let err = PRICES_DAILY_SCHEMA.validate(&df).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("high"));
    }

    #[test]
    fn rejects_retyped_column() {
        let mut df = prices_frame(false);
        df.with_column(Column::new("contributing_sources".into(), &["binance"]))
            .unwrap();
        assert!(PRICES_DAILY_SCHEMA.validate(&df).is_err());
    }

    #[test]
    fn versions_default_and_outdated() {
        let fresh = SchemaVersions::current();
        assert_eq!(fresh.get(PRICES_DAILY), 2);
        assert!(fresh.outdated().is_empty());

        let mut old = SchemaVersions::current();
        old.set(PRICES_DAILY, 1);
        let outdated = old.outdated();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].0.name, PRICES_DAILY);
        assert_eq!(outdated[0].1, 1);

        // absent tables read as v1
        assert_eq!(SchemaVersions(BTreeMap::new()).get(ASSETS), 1);
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(current(RAW_DAILY).map(|t| t.version), Some(1));
        assert!(current("nope").is_none());
        assert!(PRICES_DAILY_SCHEMA.column("open").is_some_and(|c| !c.required));
    }
}
