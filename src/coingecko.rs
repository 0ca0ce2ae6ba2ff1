//! CoinGecko REST access: rate gate, bounded retry and the HTTP fetcher seam.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const COINGECKO_COINS_BASE_URL: &str = "https://api.coingecko.com/api/v3/coins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DaysWindow {
    MostRecentDay,
    EntireHistory,
}

impl DaysWindow {
    pub fn as_query_value(self) -> &'static str {
        match self {
            Self::MostRecentDay => "1",
            Self::EntireHistory => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
}

/// One `[epochMillis, value]` pair as returned by `market_chart`. CoinGecko
/// sends `null` for days it has no market cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(i64, Option<f64>)", into = "(i64, Option<f64>)")]
pub struct RawPoint {
    pub ts_ms: i64,
    pub value: Option<f64>,
}

impl From<(i64, Option<f64>)> for RawPoint {
    fn from((ts_ms, value): (i64, Option<f64>)) -> Self {
        Self { ts_ms, value }
    }
}

impl From<(i64, f64)> for RawPoint {
    fn from((ts_ms, value): (i64, f64)) -> Self {
        Self {
            ts_ms,
            value: Some(value),
        }
    }
}

impl From<RawPoint> for (i64, Option<f64>) {
    fn from(point: RawPoint) -> Self {
        (point.ts_ms, point.value)
    }
}

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    market_caps: Vec<RawPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("no usable data for {coin_id}: {points} point(s) returned")]
    InsufficientData { coin_id: String, points: usize },
}

/// Result of a retried request. `Exhausted` keeps the error of the final attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Success(T),
    Exhausted { attempts: u32, last_error: FetchError },
}

impl<T> FetchOutcome<T> {
    pub fn into_result(self) -> Result<T, FetchError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Upper bound for the spacing between request starts.
pub const MAX_SPACING: Duration = Duration::from_secs(24 * 60 * 60);

/// Enforces a minimum spacing between the starts of consecutive requests.
///
/// Slots are reserved under the lock and waited for outside it, so one gate
/// shared by several workers spaces requests globally. A request that takes
/// longer than the spacing leaves no extra delay for the next caller.
#[derive(Debug)]
pub struct RateGate {
    min_spacing: Duration,
    next_start: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_start: Mutex::new(None),
        }
    }

    /// Spacing of `1 / requests_per_second`, capped at [`MAX_SPACING`].
    /// Zero, negative or NaN rates leave the gate open; configuration rejects
    /// them before they get here.
    pub fn per_second(requests_per_second: f64) -> Self {
        if requests_per_second.is_nan() || requests_per_second <= 0.0 {
            return Self::new(Duration::ZERO);
        }
        let spacing = Duration::try_from_secs_f64(1.0 / requests_per_second)
            .map_or(MAX_SPACING, |spacing| spacing.min(MAX_SPACING));
        Self::new(spacing)
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    pub fn acquire(&self) {
        let wait = {
            let mut next = self
                .next_start
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let start = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = start.checked_add(self.min_spacing).or(Some(start));
            start - now
        };

        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

pub struct CoinGeckoClient<F> {
    fetcher: F,
    base_url: String,
    rate_gate: RateGate,
    retry: RetryPolicy,
}

impl<F: HttpFetcher> CoinGeckoClient<F> {
    pub fn new(
        fetcher: F,
        base_url: impl Into<String>,
        rate_gate: RateGate,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_gate,
            retry,
        }
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.rate_gate
    }

    pub fn catalog_url(&self) -> String {
        format!("{}/list", self.base_url)
    }

    pub fn market_chart_url(&self, coin_id: &str, window: DaysWindow) -> String {
        format!(
            "{}/{coin_id}/market_chart?vs_currency=usd&days={}&interval=daily",
            self.base_url,
            window.as_query_value()
        )
    }

    /// Full coin catalog (`GET /list`).
    pub fn fetch_catalog(&self) -> FetchOutcome<Vec<CatalogEntry>> {
        let url = self.catalog_url();
        retry(&self.retry, "catalog", || self.get_json(&url))
    }

    /// Daily market caps for one coin. Responses with one point or fewer are
    /// rejected and retried: the trailing point is always unconfirmed.
    pub fn fetch_market_caps(
        &self,
        coin_id: &str,
        window: DaysWindow,
    ) -> FetchOutcome<Vec<RawPoint>> {
        let url = self.market_chart_url(coin_id, window);
        retry(&self.retry, coin_id, || {
            let response: MarketChartResponse = self.get_json(&url)?;
            if response.market_caps.len() <= 1 {
                return Err(FetchError::InsufficientData {
                    coin_id: coin_id.to_string(),
                    points: response.market_caps.len(),
                });
            }
            Ok(response.market_caps)
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.rate_gate.acquire();
        let started = Instant::now();
        let bytes = self.fetcher.get_bytes(url)?;
        debug!(
            component = "coingecko",
            event = "fetch.response",
            url,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

fn retry<T>(
    policy: &RetryPolicy,
    target: &str,
    mut f: impl FnMut() -> Result<T, FetchError>,
) -> FetchOutcome<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match f() {
            Ok(value) => return FetchOutcome::Success(value),
            Err(err) if attempt >= max_attempts => {
                warn!(
                    component = "coingecko",
                    event = "fetch.exhausted",
                    target,
                    attempts = attempt,
                    error = %err
                );
                return FetchOutcome::Exhausted {
                    attempts: attempt,
                    last_error: err,
                };
            }
            Err(err) => {
                warn!(
                    component = "coingecko",
                    event = "fetch.retry",
                    target,
                    attempt,
                    max_attempts,
                    backoff_ms = policy.backoff_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(policy.backoff_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, FetchError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn push(self, url: &str, body: Result<&str, &str>) -> Self {
            let entry = match body {
                Ok(text) => Ok(text.as_bytes().to_vec()),
                Err(message) => Err(FetchError::HttpRequest {
                    url: url.to_string(),
                    message: message.to_string(),
                }),
            };
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(entry);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl HttpFetcher for ScriptedFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| {
                    Err(FetchError::HttpRequest {
                        url: url.to_string(),
                        message: "missing mock response".to_string(),
                    })
                })
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: 0,
        }
    }

    fn client(fetcher: ScriptedFetcher, max_attempts: u32) -> CoinGeckoClient<ScriptedFetcher> {
        CoinGeckoClient::new(
            fetcher,
            "http://mock/coins/",
            RateGate::new(Duration::ZERO),
            fast_retry(max_attempts),
        )
    }

    const CHART_URL: &str =
        "http://mock/coins/bitcoin/market_chart?vs_currency=usd&days=max&interval=daily";

    #[test]
    fn urls_match_coingecko_layout() {
        let c = client(ScriptedFetcher::default(), 1);
        assert_eq!(c.catalog_url(), "http://mock/coins/list");
        assert_eq!(c.market_chart_url("bitcoin", DaysWindow::EntireHistory), CHART_URL);
        assert!(c
            .market_chart_url("bitcoin", DaysWindow::MostRecentDay)
            .contains("days=1&"));
    }

    #[test]
    fn market_caps_are_decoded_in_order() {
        let fetcher = ScriptedFetcher::default().push(
            CHART_URL,
            Ok(r#"{"prices":[],"market_caps":[[1644796800000,800000],[1644883200000,850000.5]]}"#),
        );
        let c = client(fetcher, 1);

        let points = c
            .fetch_market_caps("bitcoin", DaysWindow::EntireHistory)
            .into_result()
            .unwrap();
        assert_eq!(
            points,
            vec![
                RawPoint { ts_ms: 1_644_796_800_000, value: Some(800_000.0) },
                RawPoint { ts_ms: 1_644_883_200_000, value: Some(850_000.5) },
            ]
        );
    }

    #[test]
    fn null_market_caps_decode_as_missing_values() {
        let fetcher = ScriptedFetcher::default().push(
            CHART_URL,
            Ok(r#"{"market_caps":[[1644796800000,null],[1644883200000,850000]]}"#),
        );
        let c = client(fetcher, 1);

        let points = c
            .fetch_market_caps("bitcoin", DaysWindow::EntireHistory)
            .into_result()
            .unwrap();
        assert_eq!(points[0].value, None);
        assert_eq!(points[1].value, Some(850_000.0));
        assert_eq!(c.fetcher.call_count(), 1);
    }

    #[test]
    fn single_point_response_is_retried_until_usable() {
        let fetcher = ScriptedFetcher::default()
            .push(CHART_URL, Ok(r#"{"market_caps":[[1644796800000,1]]}"#))
            .push(CHART_URL, Ok("<html>rate limited</html>"))
            .push(CHART_URL, Err("connection reset"))
            .push(
                CHART_URL,
                Ok(r#"{"market_caps":[[1644796800000,1],[1644883200000,2]]}"#),
            );
        let c = client(fetcher, 5);

        let outcome = c.fetch_market_caps("bitcoin", DaysWindow::EntireHistory);
        assert!(outcome.is_success());
        assert_eq!(c.fetcher.call_count(), 4);
    }

    #[test]
    fn exhausted_retries_surface_last_error() {
        let fetcher = ScriptedFetcher::default()
            .push(CHART_URL, Err("timeout"))
            .push(CHART_URL, Ok(r#"{"market_caps":[]}"#));
        let c = client(fetcher, 2);

        let outcome = c.fetch_market_caps("bitcoin", DaysWindow::EntireHistory);
        match outcome {
            FetchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    last_error,
                    FetchError::InsufficientData {
                        coin_id: "bitcoin".to_string(),
                        points: 0
                    }
                );
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(c.fetcher.call_count(), 2);
    }

    #[test]
    fn zero_attempt_policy_still_tries_once() {
        let fetcher = ScriptedFetcher::default().push("http://mock/coins/list", Ok("[]"));
        let c = client(fetcher, 0);
        assert_eq!(c.fetch_catalog(), FetchOutcome::Success(Vec::new()));
    }

    #[test]
    fn catalog_entries_tolerate_missing_name() {
        let fetcher = ScriptedFetcher::default().push(
            "http://mock/coins/list",
            Ok(r#"[{"id":"bitcoin","symbol":"btc","name":"Bitcoin"},{"id":"x","symbol":"x"}]"#),
        );
        let c = client(fetcher, 1);
        let catalog = c.fetch_catalog().into_result().unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[1].name, "");
    }

    #[test]
    fn rate_gate_spaces_consecutive_starts() {
        let gate = RateGate::per_second(20.0);
        assert_eq!(gate.min_spacing(), Duration::from_millis(50));

        let started = Instant::now();
        gate.acquire();
        gate.acquire();
        gate.acquire();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn rate_gate_does_not_penalize_slow_requests() {
        let gate = RateGate::new(Duration::from_millis(20));
        gate.acquire();
        std::thread::sleep(Duration::from_millis(40));

        let started = Instant::now();
        gate.acquire();
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn non_positive_rate_disables_spacing() {
        assert_eq!(RateGate::per_second(0.0).min_spacing(), Duration::ZERO);
        assert_eq!(RateGate::per_second(f64::NAN).min_spacing(), Duration::ZERO);
    }

    #[test]
    fn tiny_rates_are_capped_instead_of_overflowing() {
        assert_eq!(RateGate::per_second(1e-300).min_spacing(), MAX_SPACING);
        assert_eq!(RateGate::per_second(f64::MIN_POSITIVE).min_spacing(), MAX_SPACING);
        assert_eq!(
            RateGate::per_second(f64::INFINITY).min_spacing(),
            Duration::ZERO
        );

        let gate = RateGate::new(Duration::MAX);
        gate.acquire();
    }
}
