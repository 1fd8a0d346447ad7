//! Multi-source reconciliation.
//!
//! Merge policy for one `(asset_id, day)`:
//! - sources are totally ordered: configured ranking first, then unranked
//!   sources by name
//! - the best-ranked source with a record is the primary; every value of the
//!   canonical record comes from it
//! - `contributing_sources` is every source that reported the day
//! - `ingested_at` is the latest `fetched_at` among them, so the output is a
//!   pure function of the input records
//! - a non-primary source whose high or low differs from the primary by more
//!   than the tolerance produces a `DiscrepancyFlag`; the record is still
//!   produced

use crate::config::ReconcileConfig;
use crate::domain::{AssetId, CanonicalRecord, DayKey, RawRecord, SourceId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Total order over sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePriority {
    ranking: Vec<SourceId>,
}

impl SourcePriority {
    pub fn new(ranking: Vec<SourceId>) -> Self {
        Self { ranking }
    }

    /// Sort key: (rank index, name). Unranked sources share rank `len`.
    pub fn rank<'a>(&self, source: &'a SourceId) -> (usize, &'a str) {
        let idx = self
            .ranking
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.ranking.len());
        (idx, source.as_str())
    }
}

/// Which price field disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    High,
    Low,
}

/// Advisory tag: two sources disagree beyond tolerance. Never blocks a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyFlag {
    pub asset_id: AssetId,
    pub day: NaiveDate,
    pub field: PriceField,
    pub primary_source: SourceId,
    pub other_source: SourceId,
    pub primary_value: f64,
    pub other_value: f64,
    pub relative_diff: f64,
}

impl DiscrepancyFlag {
    pub fn key(&self) -> DayKey {
        DayKey::new(self.asset_id.clone(), self.day)
    }
}

/// Reconciliation output.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub record: CanonicalRecord,
    pub flags: Vec<DiscrepancyFlag>,
}

impl Reconciled {
    pub fn needs_review(&self) -> bool {
        !self.flags.is_empty()
    }
}

/// Merges one `(asset_id, day)` across sources: the highest-ranked source
/// with data supplies the values, disagreements beyond `tolerance` are flagged.
#[derive(Debug, Clone)]
pub struct Reconciler {
    priority: SourcePriority,
    tolerance: f64,
}

impl Reconciler {
    pub fn new(priority: SourcePriority, tolerance: f64) -> Self {
        Self {
            priority,
            tolerance,
        }
    }

    /// Reconciler for the `[reconcile]` section.
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(
            SourcePriority::new(config.source_priority.clone()),
            config.discrepancy_tolerance,
        )
    }

    /// Relative difference above which sources are flagged.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Merge every source's record for `(asset_id, day)`.
    ///
    /// Records for other keys are ignored. If a source appears twice the later
    /// `fetched_at` wins, ties going to the larger values. Returns `None` when no source reported the day.
    pub fn reconcile(
        &self,
        asset_id: &AssetId,
        day: NaiveDate,
        records: &[RawRecord],
    ) -> Option<Reconciled> {
        let mut by_source: BTreeMap<&SourceId, &RawRecord> = BTreeMap::new();
        for rec in records {
            if &rec.asset_id != asset_id || rec.day != day {
                debug!(asset_id = %rec.asset_id, day = %rec.day, "ignoring record for another key");
                continue;
            }
            by_source
                .entry(&rec.source)
                .and_modify(|cur| {
                    if supersedes(rec, cur) {
                        *cur = rec;
                    }
                })
                .or_insert(rec);
        }

        let mut ranked: Vec<&RawRecord> = by_source.into_values().collect();
        ranked.sort_by(|a, b| self.priority.rank(&a.source).cmp(&self.priority.rank(&b.source)));

        let primary = *ranked.first()?;
        let contributing_sources: BTreeSet<SourceId> =
            ranked.iter().map(|r| r.source.clone()).collect();
        let ingested_at = ranked.iter().map(|r| r.fetched_at).max()?;

        let mut flags = Vec::new();
        for other in ranked.iter().skip(1) {
            for (field, p, o) in [
                (PriceField::High, primary.high, other.high),
                (PriceField::Low, primary.low, other.low),
            ] {
                let diff = relative_diff(p, o);
                if diff > self.tolerance {
                    warn!(
                        asset_id = %asset_id,
                        day = %day,
                        field = ?field,
                        primary = %primary.source,
                        other = %other.source,
                        relative_diff = diff,
                        "source discrepancy above tolerance"
                    );
                    flags.push(DiscrepancyFlag {
                        asset_id: asset_id.clone(),
                        day,
                        field,
                        primary_source: primary.source.clone(),
                        other_source: other.source.clone(),
                        primary_value: p,
                        other_value: o,
                        relative_diff: diff,
                    });
                }
            }
        }

        Some(Reconciled {
            record: CanonicalRecord {
                asset_id: asset_id.clone(),
                day,
                high: primary.high,
                low: primary.low,
                volume: primary.volume,
                open: primary.open,
                close: primary.close,
                contributing_sources,
                ingested_at,
            },
            flags,
        })
    }
}

/// Whether `candidate` replaces `current` as a source's record for the day:
/// later fetch first, then larger high, low, volume, open, close.
fn supersedes(candidate: &RawRecord, current: &RawRecord) -> bool {
    fn opt(v: Option<f64>) -> f64 {
        v.unwrap_or(f64::NEG_INFINITY)
    }
    candidate
        .fetched_at
        .cmp(&current.fetched_at)
        .then_with(|| candidate.high.total_cmp(&current.high))
        .then_with(|| candidate.low.total_cmp(&current.low))
        .then_with(|| candidate.volume.total_cmp(&current.volume))
        .then_with(|| opt(candidate.open).total_cmp(&opt(current.open)))
        .then_with(|| opt(candidate.close).total_cmp(&opt(current.close)))
        .is_gt()
}

/// `|other - primary| / |primary|`; infinite when the primary is zero and the
/// other is not.
pub fn relative_diff(primary: f64, other: f64) -> f64 {
    let delta = (other - primary).abs();
    if delta == 0.0 {
        0.0
    } else if primary == 0.0 {
        f64::INFINITY
    } else {
        delta / primary.abs()
    }
}
