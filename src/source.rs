use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};
use tokio::time::sleep;
use tokio_retry::{
    RetryIf,
    strategy::{ExponentialBackoff, jitter},
};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Result, RotationError};
use crate::series::Bar;

/// Anything that can produce daily bars for a ticker over an inclusive date range.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Daily bars in `[start, end]`, sorted by date. An empty vector means the
    /// vendor has nothing for that range.
    async fn daily_bars(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;
}

/// Row as returned by the Tiingo end-of-day endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TiingoRow {
    date: String,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    adj_close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

impl TiingoRow {
    fn into_bar(self) -> Option<Bar> {
        let date = NaiveDate::parse_from_str(self.date.get(..10)?, "%Y-%m-%d").ok()?;
        Some(Bar {
            date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            adj_close: self.adj_close,
            volume: self.volume,
        })
    }
}

/// One failed vendor attempt. Only `transient` failures are retried.
#[derive(Debug)]
struct AttemptError {
    transient: bool,
    reason: String,
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            transient: e.is_timeout() || e.is_connect() || e.is_request(),
            reason: e.to_string(),
        }
    }
}

/// Rate limiting and server-side errors; client errors never succeed on retry.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Tiingo end-of-day price client.
pub struct TiingoSource {
    client: Client,
    base_url: String,
    request_delay: StdDuration,
    max_retries: usize,
    max_days_per_request: i64,
}

impl TiingoSource {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.tiingo.com/tiingo";

    pub fn new(api_key: &str, settings: &Settings) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RotationError::Configuration(
                "missing Tiingo API key (set TIINGO_API_KEY or pass --api-key)".into(),
            ));
        }
        Ok(Self {
            client: mk_client(api_key, settings.request_timeout_secs)?,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            request_delay: StdDuration::from_millis(settings.request_delay_ms),
            max_retries: settings.max_retries,
            max_days_per_request: settings.max_days_per_request.max(1),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn prices_url(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<reqwest::Url> {
        let base = format!("{}/daily/{}/prices", self.base_url, ticker);
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("startDate", start.format("%Y-%m-%d").to_string()),
                ("endDate", end.format("%Y-%m-%d").to_string()),
                ("format", "json".into()),
                ("resampleFreq", "daily".into()),
            ],
        )
        .map_err(|e| RotationError::fetch(ticker, e))
    }

    /// GET with a bounded retry budget and exponential backoff. Connection
    /// failures, timeouts, 429 and 5xx are retried; everything else fails at once.
    async fn get_rows(&self, ticker: &str, url: reqwest::Url) -> Result<Vec<TiingoRow>> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(150)
            .map(jitter)
            .take(self.max_retries);
        let attempt = || {
            let url = url.clone();
            async move {
                let resp = self.client.get(url).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    let txt = resp.text().await.unwrap_or_default();
                    let transient = is_transient_status(status);
                    if transient {
                        info!("{} {} -> retrying", ticker, status);
                    }
                    return Err(AttemptError {
                        transient,
                        reason: format!("HTTP {status}; body: {txt}"),
                    });
                }
                resp.json::<Vec<TiingoRow>>().await.map_err(|e| AttemptError {
                    transient: false,
                    reason: format!("malformed payload: {e}"),
                })
            }
        };
        RetryIf::spawn(strategy, attempt, |e: &AttemptError| e.transient)
            .await
            .map_err(|e| RotationError::fetch(ticker, e.reason))
    }
}

#[async_trait]
impl PriceSource for TiingoSource {
    fn name(&self) -> &str {
        "tiingo"
    }

    async fn daily_bars(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        if end < start {
            return Ok(vec![]);
        }
        let mut cur_from = start;
        let mut bars: Vec<Bar> = vec![];

        while cur_from <= end {
            let cur_to = (cur_from + Duration::days(self.max_days_per_request - 1)).min(end);
            let url = self.prices_url(ticker, cur_from, cur_to)?;
            debug!("GET {} [{} .. {}]", ticker, cur_from, cur_to);
            let rows = self.get_rows(ticker, url).await;
            // vendor rate limit: fixed pause after every request, success or not
            sleep(self.request_delay).await;
            bars.extend(rows?.into_iter().filter_map(TiingoRow::into_bar));
            cur_from = cur_to + Duration::days(1);
        }

        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Ok(bars)
    }
}

/// Make an HTTP client with the Tiingo token header and an explicit timeout.
pub fn mk_client(api_key: &str, timeout_secs: u64) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    let token = header::HeaderValue::from_str(&format!("Token {api_key}"))
        .map_err(|e| RotationError::Configuration(format!("invalid API key: {e}")))?;
    headers.insert(header::AUTHORIZATION, token);
    let client = Client::builder()
        .default_headers(headers)
        .user_agent("sector_rotation/0.1 (rust)")
        .timeout(StdDuration::from_secs(timeout_secs))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()
        .map_err(|e| RotationError::Configuration(format!("cannot build HTTP client: {e}")))?;
    Ok(client)
}

/// A recorded request made against an [`InMemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub ticker: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Price source backed by bars held in memory. Records every request it serves.
#[derive(Clone, Default)]
pub struct InMemorySource {
    bars: Arc<Mutex<BTreeMap<String, Vec<Bar>>>>,
    failing: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the history served for `ticker`.
    pub fn insert(&self, ticker: &str, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.date);
        if let Ok(mut map) = self.bars.lock() {
            map.insert(ticker.to_string(), bars);
        }
    }

    /// Serves a close-only history.
    pub fn insert_closes(&self, ticker: &str, closes: &[(NaiveDate, f64)]) {
        self.insert(
            ticker,
            closes.iter().map(|(d, c)| Bar::from_close(*d, *c)).collect(),
        );
    }

    /// Every request for `ticker` fails with a fetch error from now on.
    pub fn fail(&self, ticker: &str) {
        if let Ok(mut f) = self.failing.lock() {
            f.push(ticker.to_string());
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn clear_requests(&self) {
        if let Ok(mut r) = self.requests.lock() {
            r.clear();
        }
    }
}

#[async_trait]
impl PriceSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn daily_bars(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(FetchRequest {
                ticker: ticker.to_string(),
                start,
                end,
            });
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.iter().any(|t| t == ticker))
            .unwrap_or(false);
        if failing {
            warn!("{} configured to fail", ticker);
            return Err(RotationError::fetch(ticker, "connection refused"));
        }
        let map = self
            .bars
            .lock()
            .map_err(|_| RotationError::fetch(ticker, "source poisoned"))?;
        Ok(map
            .get(ticker)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpListener,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_tiingo_row_parses_timestamp_date() {
        let rows: Vec<TiingoRow> = serde_json::from_str(
            r#"[{"date":"2024-01-05T00:00:00.000Z","open":1.0,"high":2.0,"low":0.5,"close":1.5,"adjClose":1.4,"volume":1000}]"#,
        )
        .unwrap();
        let bar = rows.into_iter().next().unwrap().into_bar().unwrap();
        assert_eq!(bar.date, d("2024-01-05"));
        assert_eq!(bar.adj_close, Some(1.4));
        assert_eq!(bar.volume, Some(1000.0));
    }

    /// Serves `status` with an empty body to every connection; returns the
    /// base URL and the connection counter.
    fn serve_status(status: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn quick_settings(max_retries: usize) -> Settings {
        Settings {
            request_delay_ms: 0,
            request_timeout_secs: 5,
            max_retries,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (base, hits) = serve_status("404 Not Found");
        let src = TiingoSource::new("k", &quick_settings(3)).unwrap().with_base_url(base);
        let res = src.daily_bars("XLK", d("2024-01-02"), d("2024-01-05")).await;
        assert!(matches!(res, Err(RotationError::Fetch { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_use_the_retry_budget() {
        let (base, hits) = serve_status("503 Service Unavailable");
        let src = TiingoSource::new("k", &quick_settings(2)).unwrap().with_base_url(base);
        let res = src.daily_bars("XLK", d("2024-01-02"), d("2024-01-05")).await;
        assert!(matches!(res, Err(RotationError::Fetch { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let res = TiingoSource::new("  ", &Settings::default());
        assert!(matches!(res, Err(RotationError::Configuration(_))));
    }

    #[test]
    fn test_prices_url_carries_range() {
        let src = TiingoSource::new("k", &Settings::default()).unwrap();
        let url = src.prices_url("XLK", d("2024-01-01"), d("2024-02-01")).unwrap();
        let s = url.as_str();
        assert!(s.starts_with("https://api.tiingo.com/tiingo/daily/XLK/prices?"));
        assert!(s.contains("startDate=2024-01-01"));
        assert!(s.contains("endDate=2024-02-01"));
    }

    #[tokio::test]
    async fn test_in_memory_source_filters_range_and_records() {
        let src = InMemorySource::new();
        src.insert_closes(
            "SPY",
            &[(d("2024-01-02"), 1.0), (d("2024-01-03"), 2.0), (d("2024-01-04"), 3.0)],
        );
        let bars = src.daily_bars("SPY", d("2024-01-03"), d("2024-01-10")).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(src.requests().len(), 1);
        src.fail("SPY");
        assert!(src.daily_bars("SPY", d("2024-01-03"), d("2024-01-10")).await.is_err());
    }
}
