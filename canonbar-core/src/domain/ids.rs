use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique key of a registered asset (e.g. `btc`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Asset ids name partition directories: ASCII alphanumerics, `-`, `_`, `.`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of an upstream data source (e.g. `binance`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `(asset_id, day)`: the key of a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayKey {
    pub asset_id: AssetId,
    pub day: NaiveDate,
}

impl DayKey {
    pub fn new(asset_id: AssetId, day: NaiveDate) -> Self {
        Self { asset_id, day }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.asset_id, self.day)
    }
}

/// `(asset_id, day, source)`: the key of a raw record and of a backfill task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub asset_id: AssetId,
    pub day: NaiveDate,
    pub source: SourceId,
}

impl TaskKey {
    pub fn new(asset_id: AssetId, day: NaiveDate, source: SourceId) -> Self {
        Self {
            asset_id,
            day,
            source,
        }
    }

    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.asset_id.clone(), self.day)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.asset_id, self.day, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_orders_by_asset_then_day_then_source() {
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut keys = vec![
            TaskKey::new("eth".into(), d1, "a".into()),
            TaskKey::new("btc".into(), d2, "a".into()),
            TaskKey::new("btc".into(), d1, "b".into()),
            TaskKey::new("btc".into(), d1, "a".into()),
        ];
        keys.sort();

        assert_eq!(keys[0].to_string(), "btc@2024-01-01/a");
        assert_eq!(keys[1].to_string(), "btc@2024-01-01/b");
        assert_eq!(keys[2].to_string(), "btc@2024-01-02/a");
        assert_eq!(keys[3].to_string(), "eth@2024-01-01/a");
    }

    #[test]
    fn asset_id_validity() {
        assert!(AssetId::from("btc").is_valid());
        assert!(AssetId::from("usd-coin_2.0").is_valid());
        assert!(!AssetId::from("").is_valid());
        assert!(!AssetId::from("..").is_valid());
        assert!(!AssetId::from("a/b").is_valid());
    }

    #[test]
    fn day_key_drops_source() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let key = TaskKey::new("btc".into(), day, "binance".into());
        assert_eq!(key.day_key(), DayKey::new("btc".into(), day));
    }
}
