//! Source adapters: one upstream provider each, behind a fixed `fetch` contract.
//!
//! Adapters only read from providers. They never touch canonical state.

pub mod circuit_breaker;
pub mod csv;
pub mod fixture;
pub mod http;
pub mod normalize;

pub use circuit_breaker::CircuitBreaker;
pub use self::csv::CsvAdapter;
pub use fixture::{DayScript, FixtureAdapter, FixtureBar};
pub use http::{HttpAdapter, ProviderFormat};

use crate::config::{ConfigError, PipelineConfig, SourceFormat};
use crate::domain::{Asset, DayRange, RawRecord, SourceId};
use crate::error::FetchError;
use std::sync::Arc;

/// Lazy, finite sequence of per-day results.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<RawRecord, FetchError>> + Send + 'a>;

pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &SourceId;

    /// Records for `asset` over `range`. Each call starts a fresh stream from
    /// the first day; nothing is fetched until the stream is polled.
    fn fetch(&self, asset: &Asset, range: DayRange) -> RecordStream<'_>;

    /// False while the source refuses requests (circuit breaker open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Stream that fetches one page of days at a time.
pub(crate) struct PagedStream<'a> {
    pages: std::vec::IntoIter<DayRange>,
    pending: std::vec::IntoIter<Result<RawRecord, FetchError>>,
    fetch_page: Box<dyn FnMut(DayRange) -> Vec<Result<RawRecord, FetchError>> + Send + 'a>,
}

impl<'a> PagedStream<'a> {
    pub(crate) fn new(
        range: DayRange,
        page_days: usize,
        fetch_page: impl FnMut(DayRange) -> Vec<Result<RawRecord, FetchError>> + Send + 'a,
    ) -> Self {
        Self {
            pages: range.chunks(page_days).into_iter(),
            pending: Vec::new().into_iter(),
            fetch_page: Box::new(fetch_page),
        }
    }
}

impl Iterator for PagedStream<'_> {
    type Item = Result<RawRecord, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(item);
            }
            let page = self.pages.next()?;
            self.pending = (self.fetch_page)(page).into_iter();
        }
    }
}

/// Build one adapter per configured source, each with its own breaker.
pub fn build_adapters(config: &PipelineConfig) -> Result<Vec<Arc<dyn SourceAdapter>>, ConfigError> {
    config
        .sources
        .iter()
        .map(|source| -> Result<Arc<dyn SourceAdapter>, ConfigError> {
            let breaker = Arc::new(CircuitBreaker::from_config(&config.circuit_breaker));
            Ok(match source.format {
                SourceFormat::Csv => Arc::new(CsvAdapter::from_config(source)?),
                SourceFormat::BinanceKlines
                | SourceFormat::CoinbaseCandles
                | SourceFormat::KrakenOhlc => Arc::new(HttpAdapter::from_config(source, breaker)?),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn paged_stream_is_lazy() {
        let calls = AtomicUsize::new(0);
        let d = |n| NaiveDate::from_ymd_opt(2024, 1, n).unwrap();
        let range = DayRange::new(d(1), d(10)).unwrap();

        let mut stream = PagedStream::new(range, 4, |page| {
            calls.fetch_add(1, Ordering::SeqCst);
            page.days()
                .map(|day| Err(FetchError::data_format(&"s".into(), day, "no data")))
                .collect()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        stream.next();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.count(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn builds_adapters_from_config() {
        let config = PipelineConfig::from_toml(
            r#"
[[sources]]
name = "binance"
format = "binance_klines"
base_url = "http://127.0.0.1:9"

[[sources]]
name = "archive"
format = "csv"
dir = "does-not-matter"
"#,
        )
        .unwrap();
        let adapters = build_adapters(&config).unwrap();
        let names: Vec<&str> = adapters.iter().map(|a| a.source().as_str()).collect();
        assert_eq!(names, vec!["binance", "archive"]);
        assert!(adapters.iter().all(|a| a.is_available()));
    }
}
