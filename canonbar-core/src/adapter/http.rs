//! HTTP source adapter for exchange REST APIs.
//!
//! One adapter type serves every exchange: `ProviderFormat` selects the
//! endpoint and the field mapping. Status handling:
//! - 403: ban, trips the circuit breaker
//! - 429: `RateLimited` with the provider's `retry-after`
//! - 5xx, connect errors, timeouts: `Transient`
//! - 404, other 4xx, unparsable bodies: `DataFormat` for every day of the page

use super::circuit_breaker::CircuitBreaker;
use super::normalize::{fetch_time, records_for_page};
use super::{PagedStream, RecordStream, SourceAdapter};
use crate::align::Granularity;
use crate::config::{ConfigError, SourceConfig, SourceFormat};
use crate::domain::{Asset, DayRange, Observation, RawRecord, SourceId};
use crate::error::FetchError;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Field mapping and endpoint of one exchange API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFormat {
    /// `GET /api/v3/klines`: rows `[open_time_ms, "o", "h", "l", "c", "v", ...]`.
    BinanceKlines,
    /// `GET /products/{id}/candles`: rows `[time_s, low, high, open, close, volume]`.
    CoinbaseCandles,
    /// `GET /0/public/OHLC`: `{"error": [], "result": {"<pair>": [[time_s, "o", "h", "l", "c", "vwap", "v", count]]}}`.
    KrakenOhlc,
}

impl ProviderFormat {
    pub fn from_source_format(format: SourceFormat) -> Option<Self> {
        match format {
            SourceFormat::BinanceKlines => Some(ProviderFormat::BinanceKlines),
            SourceFormat::CoinbaseCandles => Some(ProviderFormat::CoinbaseCandles),
            SourceFormat::KrakenOhlc => Some(ProviderFormat::KrakenOhlc),
            SourceFormat::Csv => None,
        }
    }

    /// All supported endpoints are queried at daily resolution, bars opening
    /// at UTC midnight.
    pub fn granularity(&self) -> Granularity {
        Granularity::Daily
    }

    /// Most rows one request returns.
    pub fn page_days(&self) -> usize {
        match self {
            ProviderFormat::BinanceKlines => 1000,
            ProviderFormat::CoinbaseCandles => 300,
            ProviderFormat::KrakenOhlc => 720,
        }
    }

    pub fn url(&self, base_url: &str, symbol: &str, page: DayRange) -> String {
        let base = base_url.trim_end_matches('/');
        let start = day_start(page.start());
        let end = day_start(page.end());
        match self {
            ProviderFormat::BinanceKlines => format!(
                "{base}/api/v3/klines?symbol={symbol}&interval=1d&startTime={}&endTime={}&limit={}",
                start.timestamp_millis(),
                end.timestamp_millis() + 86_400_000 - 1,
                self.page_days()
            ),
            ProviderFormat::CoinbaseCandles => format!(
                "{base}/products/{symbol}/candles?granularity=86400&start={}&end={}",
                start.to_rfc3339_opts(SecondsFormat::Secs, true),
                end.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            ProviderFormat::KrakenOhlc => format!(
                "{base}/0/public/OHLC?pair={symbol}&interval=1440&since={}",
                start.timestamp() - 1
            ),
        }
    }

    /// Parse a response body into observations.
    pub fn parse(&self, body: &str) -> Result<Vec<Observation>, String> {
        let json: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
        match self {
            ProviderFormat::BinanceKlines => parse_rows(&json, |row| {
                Some(Observation {
                    timestamp: DateTime::from_timestamp_millis(row.first()?.as_i64()?)?,
                    open: Some(number(row.get(1)?)?),
                    high: number(row.get(2)?)?,
                    low: number(row.get(3)?)?,
                    close: Some(number(row.get(4)?)?),
                    volume: number(row.get(5)?)?,
                })
            }),
            ProviderFormat::CoinbaseCandles => parse_rows(&json, |row| {
                Some(Observation {
                    timestamp: DateTime::from_timestamp(row.first()?.as_i64()?, 0)?,
                    low: number(row.get(1)?)?,
                    high: number(row.get(2)?)?,
                    open: Some(number(row.get(3)?)?),
                    close: Some(number(row.get(4)?)?),
                    volume: number(row.get(5)?)?,
                })
            }),
            ProviderFormat::KrakenOhlc => {
                if let Some(errors) = json.get("error").and_then(Value::as_array) {
                    if !errors.is_empty() {
                        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                        return Err(format!("provider error: {}", joined.join(", ")));
                    }
                }
                let result = json
                    .get("result")
                    .and_then(Value::as_object)
                    .ok_or("missing 'result' object")?;
                let rows = result
                    .iter()
                    .find(|(k, v)| k.as_str() != "last" && v.is_array())
                    .map(|(_, v)| v)
                    .ok_or("no pair in 'result'")?;
                parse_rows(rows, |row| {
                    Some(Observation {
                        timestamp: DateTime::from_timestamp(row.first()?.as_i64()?, 0)?,
                        open: Some(number(row.get(1)?)?),
                        high: number(row.get(2)?)?,
                        low: number(row.get(3)?)?,
                        close: Some(number(row.get(4)?)?),
                        volume: number(row.get(6)?)?,
                    })
                })
            }
        }
    }
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Exchanges send numbers either as JSON numbers or as decimal strings.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_rows(
    json: &Value,
    row: impl Fn(&[Value]) -> Option<Observation>,
) -> Result<Vec<Observation>, String> {
    let rows = json.as_array().ok_or("expected an array of rows")?;
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            r.as_array()
                .and_then(|cells| row(cells))
                .ok_or_else(|| format!("malformed row {i}: {r}"))
        })
        .collect()
}

/// Blocking REST adapter for one exchange.
pub struct HttpAdapter {
    source: SourceId,
    format: ProviderFormat,
    base_url: String,
    symbol_template: String,
    client: reqwest::blocking::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpAdapter {
    pub fn from_config(config: &SourceConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, ConfigError> {
        let invalid = |field: &str, reason: String| ConfigError::Invalid {
            field: field.to_string(),
            reason,
        };
        let format = ProviderFormat::from_source_format(config.format)
            .ok_or_else(|| invalid("sources.format", format!("'{}' is not an HTTP source", config.name)))?;
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| invalid("sources.base_url", format!("source '{}' needs a base_url", config.name)))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("canonbar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| invalid("sources", format!("HTTP client for '{}': {e}", config.name)))?;

        Ok(Self {
            source: config.name.clone(),
            format,
            base_url,
            symbol_template: config.symbol_template.clone(),
            client,
            breaker,
        })
    }

    pub fn format(&self) -> ProviderFormat {
        self.format
    }

    fn provider_symbol(&self, asset: &Asset) -> String {
        self.symbol_template.replace("{symbol}", &asset.symbol)
    }

    /// One request covering `page`.
    fn fetch_page(&self, symbol: &str, page: DayRange) -> Result<Vec<Observation>, FetchError> {
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitOpen {
                provider: self.source.clone(),
            });
        }

        let url = self.format.url(&self.base_url, symbol, page);
        debug!(source = %self.source, %url, "fetching page");

        let resp = match self.client.get(&url).send() {
            Ok(resp) => resp,
            Err(e) => {
                self.breaker.record_failure();
                return Err(FetchError::transient(&self.source, e.to_string()));
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            warn!(source = %self.source, "provider refused requests, tripping circuit breaker");
            self.breaker.trip();
            return Err(FetchError::CircuitOpen {
                provider: self.source.clone(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.breaker.record_failure();
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(FetchError::RateLimited {
                provider: self.source.clone(),
                retry_after_secs,
            });
        }
        if status.is_server_error() {
            self.breaker.record_failure();
            return Err(FetchError::transient(&self.source, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(self.page_error(page, format!("HTTP {status} for {symbol}")));
        }

        let body = resp.text().map_err(|e| {
            self.breaker.record_failure();
            FetchError::transient(&self.source, format!("reading body: {e}"))
        })?;
        self.breaker.record_success();
        self.format
            .parse(&body)
            .map_err(|reason| self.page_error(page, reason))
    }

    fn page_error(&self, page: DayRange, reason: String) -> FetchError {
        FetchError::DataFormat {
            provider: self.source.clone(),
            day: Some(page.start()),
            reason,
        }
    }
}

impl SourceAdapter for HttpAdapter {
    fn source(&self) -> &SourceId {
        &self.source
    }

    fn fetch(&self, asset: &Asset, range: DayRange) -> RecordStream<'_> {
        let symbol = self.provider_symbol(asset);
        let asset_id = asset.asset_id.clone();
        Box::new(PagedStream::new(range, self.format.page_days(), move |page| {
            match self.fetch_page(&symbol, page) {
                Ok(observations) => records_for_page(
                    &asset_id,
                    &self.source,
                    page,
                    observations,
                    self.format.granularity(),
                    fetch_time(),
                ),
                // A data error covers the whole page: report it on every day.
                Err(FetchError::DataFormat { reason, .. }) => page
                    .days()
                    .map(|day| Err(FetchError::data_format(&self.source, day, reason.clone())))
                    .collect::<Vec<Result<RawRecord, FetchError>>>(),
                Err(e) => vec![Err(e)],
            }
        }))
    }

    fn is_available(&self) -> bool {
        self.breaker.is_allowed()
    }
}
