//! Pipeline configuration, loaded from TOML.
//!
//! Every option has a default so a partial file (or no file) is valid.

use crate::domain::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub reconcile: ReconcileConfig,
    pub retry: RetryPolicy,
    pub concurrency: ConcurrencyConfig,
    pub circuit_breaker: BreakerConfig,
    pub store: StoreConfig,
    pub sources: Vec<SourceConfig>,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tol = self.reconcile.discrepancy_tolerance;
        if !tol.is_finite() || tol < 0.0 {
            return Err(invalid(
                "reconcile.discrepancy_tolerance",
                format!("must be a finite non-negative ratio, got {tol}"),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_ceiling_ms {
            return Err(invalid(
                "retry.backoff_base_ms",
                "must not exceed retry.backoff_ceiling_ms",
            ));
        }
        // Two or more retries must wait longer each time before the ceiling.
        if self.retry.max_attempts > 2
            && (self.retry.backoff_base_ms == 0
                || self.retry.backoff_base_ms >= self.retry.backoff_ceiling_ms)
        {
            return Err(invalid(
                "retry.backoff_base_ms",
                "must be positive and below retry.backoff_ceiling_ms when max_attempts > 2",
            ));
        }
        if self.concurrency.workers == 0 {
            return Err(invalid("concurrency.workers", "must be at least 1"));
        }
        if self.concurrency.per_source_limit == 0 {
            return Err(invalid("concurrency.per_source_limit", "must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.name) {
                return Err(invalid(
                    "sources.name",
                    format!("duplicate source '{}'", source.name),
                ));
            }
            source.validate()?;
        }

        for ranked in &self.reconcile.source_priority {
            if !self.sources.is_empty() && !seen.contains(ranked) {
                tracing::warn!(source = %ranked, "source_priority names a source with no [[sources]] entry");
            }
        }
        Ok(())
    }

    /// Deterministic BLAKE3 hash of the configuration, stamped on run reports.
    pub fn config_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }
}

/// Merge policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Highest priority first. Sources not listed rank after all listed ones.
    pub source_priority: Vec<SourceId>,
    /// Relative disagreement on high or low above which a record is flagged.
    pub discrepancy_tolerance: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            source_priority: Vec::new(),
            discrepancy_tolerance: 0.02,
        }
    }
}

/// Retry budget and exponential backoff shared by fetches and store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_ceiling_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `min(base * 2^(attempt-1), ceiling)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_ceiling_ms);
        Duration::from_millis(ms)
    }

    pub fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Worker threads in the backfill pool.
    pub workers: usize,
    /// In-flight fetches allowed per source.
    pub per_source_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_source_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
        }
    }
}

/// Field mapping used to normalize a provider's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    BinanceKlines,
    CoinbaseCandles,
    KrakenOhlc,
    Csv,
}

impl SourceFormat {
    pub fn is_http(&self) -> bool {
        !matches!(self, SourceFormat::Csv)
    }
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: SourceId,
    pub format: SourceFormat,
    /// API root for HTTP formats.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Provider symbol derived from the asset symbol, e.g. `{symbol}USDT`.
    #[serde(default = "default_symbol_template")]
    pub symbol_template: String,
    /// Directory of `{symbol}.csv` files for the CSV format.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Observation length for the CSV format.
    #[serde(default = "default_granularity_secs")]
    pub granularity_secs: u32,
    /// Fixed UTC offset of naive CSV timestamps.
    #[serde(default)]
    pub utc_offset_secs: i32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_symbol_template() -> String {
    "{symbol}".to_string()
}

fn default_granularity_secs() -> u32 {
    86_400
}

fn default_timeout_secs() -> u64 {
    30
}

impl SourceConfig {
    pub fn provider_symbol(&self, symbol: &str) -> String {
        self.symbol_template.replace("{symbol}", symbol)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.format.is_http() && self.base_url.is_none() {
            return Err(invalid(
                "sources.base_url",
                format!("source '{}' needs a base_url", self.name),
            ));
        }
        if self.format == SourceFormat::Csv && self.dir.is_none() {
            return Err(invalid(
                "sources.dir",
                format!("csv source '{}' needs a dir", self.name),
            ));
        }
        if self.granularity_secs == 0 {
            return Err(invalid("sources.granularity_secs", "must be positive"));
        }
        if self.utc_offset_secs.abs() >= 86_400 {
            return Err(invalid("sources.utc_offset_secs", "must be within one day"));
        }
        Ok(())
    }
}
