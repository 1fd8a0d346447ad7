//! Registered schema migrations.
//!
//! Each step rewrites one table frame from version `from` to `from + 1`.
//! `plan` chains steps from the stored version up to the current one.

use crate::error::StoreError;
use crate::schema::{self, PRICES_DAILY};
use polars::prelude::*;

pub struct Migration {
    pub table: &'static str,
    pub from: u32,
    pub to: u32,
    pub description: &'static str,
    pub apply: fn(DataFrame) -> PolarsResult<DataFrame>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("table", &self.table)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish()
    }
}

static REGISTRY: &[Migration] = &[Migration {
    table: PRICES_DAILY,
    from: 1,
    to: 2,
    description: "contributing_sources: comma-joined string to list of strings",
    apply: prices_daily_v1_to_v2,
}];

pub fn registry() -> &'static [Migration] {
    REGISTRY
}

/// Steps taking `table` from `from` to `to`, in order.
pub fn plan(table: &str, from: u32, to: u32) -> Result<Vec<&'static Migration>, StoreError> {
    let mut steps = Vec::new();
    let mut at = from;
    while at < to {
        let step = REGISTRY
            .iter()
            .find(|m| m.table == table && m.from == at)
            .ok_or_else(|| StoreError::NoMigrationPath {
                table: table.to_string(),
                from,
                to,
            })?;
        steps.push(step);
        at = step.to;
    }
    if at != to {
        return Err(StoreError::NoMigrationPath {
            table: table.to_string(),
            from,
            to,
        });
    }
    Ok(steps)
}

/// Run `steps` over `df` and check the result against the current schema.
pub fn apply(table: &str, mut df: DataFrame, steps: &[&Migration]) -> Result<DataFrame, StoreError> {
    for step in steps {
        tracing::debug!(table, from = step.from, to = step.to, "applying migration step");
        df = (step.apply)(df)?;
    }
    if let Some(schema) = schema::current(table) {
        schema.validate(&df)?;
    }
    Ok(df)
}

fn prices_daily_v1_to_v2(mut df: DataFrame) -> PolarsResult<DataFrame> {
    let joined = df.column("contributing_sources")?.str()?.clone();
    let lists: Vec<Series> = joined
        .into_iter()
        .map(|value| {
            let parts: Vec<&str> = value
                .unwrap_or("")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            Series::new(PlSmallStr::EMPTY, parts)
        })
        .collect();
    let list = Series::new("contributing_sources".into(), lists);
    df.with_column(list)?;
    Ok(df)
}
