use super::ids::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of tradable asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Coin,
    Token,
    Stablecoin,
    Fiat,
    Other,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Coin => "coin",
            AssetType::Token => "token",
            AssetType::Stablecoin => "stablecoin",
            AssetType::Fiat => "fiat",
            AssetType::Other => "other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coin" => Ok(AssetType::Coin),
            "token" => Ok(AssetType::Token),
            "stablecoin" => Ok(AssetType::Stablecoin),
            "fiat" => Ok(AssetType::Fiat),
            "other" => Ok(AssetType::Other),
            other => Err(format!("unknown asset type '{other}'")),
        }
    }
}

/// Reference entity for the `assets` table.
///
/// Assets are never deleted. Deactivation stamps `deactivated_at`, after which
/// the asset is excluded from new backfill requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: AssetId,
    pub symbol: String,
    pub asset_type: AssetType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Asset {
    pub fn new(
        asset_id: impl Into<String>,
        symbol: impl Into<String>,
        asset_type: AssetType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_id: AssetId::new(asset_id),
            symbol: symbol.into(),
            asset_type,
            created_at,
            deactivated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_type_parses_case_insensitively() {
        assert_eq!("Coin".parse::<AssetType>().unwrap(), AssetType::Coin);
        assert_eq!(
            "STABLECOIN".parse::<AssetType>().unwrap(),
            AssetType::Stablecoin
        );
        assert!("bond".parse::<AssetType>().is_err());
    }

    #[test]
    fn new_asset_is_active() {
        let asset = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
        assert!(asset.is_active());
    }
}
