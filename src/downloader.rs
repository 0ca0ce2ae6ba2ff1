//! Run orchestration: resolve once, then fetch, normalize and merge every coin.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::coingecko::{
    CoinGeckoClient, DaysWindow, FetchError, FetchOutcome, HttpFetcher, RateGate,
    ReqwestBlockingFetcher, RetryPolicy, COINGECKO_COINS_BASE_URL,
};
use crate::history::{normalize, CoinHistorySeries, DateZone, HistoryError};
use crate::store::{MarketCapStore, StoreError};
use crate::symbols::{resolve_coin_mapping, CoinMapping, ResolveError};

pub const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloaderConfig {
    pub reference_table: PathBuf,
    pub destination: PathBuf,
    pub api_base_url: String,
    pub rate_limit_per_sec: f64,
    pub retry: RetryPolicy,
    pub http_timeout_ms: u64,
    pub date_zone: DateZone,
    pub workers: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            reference_table: PathBuf::from(
                "data/symbol-properties/symbol-properties-database.csv",
            ),
            destination: PathBuf::from("output/alternative/coingecko/marketcap"),
            api_base_url: COINGECKO_COINS_BASE_URL.to_string(),
            rate_limit_per_sec: 10.0,
            retry: RetryPolicy::default(),
            http_timeout_ms: 30_000,
            date_zone: DateZone::Utc,
            workers: 1,
        }
    }
}

/// Checked between coins; a coin already in flight is finished first.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoinFailureReason {
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: FetchError },
    #[error("unusable history: {0}")]
    Normalize(HistoryError),
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoinFailure {
    pub symbol: String,
    pub coin_id: String,
    pub reason: CoinFailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub window: DaysWindow,
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<CoinFailure>,
    pub not_attempted: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.not_attempted == 0
    }

    pub fn failed_coin_ids(&self) -> Vec<&str> {
        self.failed
            .iter()
            .map(|failure| failure.coin_id.as_str())
            .collect()
    }
}

/// Fatal errors; per-coin problems end up in [`RunSummary::failed`] instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("output store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Client(#[from] FetchError),
}

pub struct Downloader<F> {
    config: DownloaderConfig,
    client: CoinGeckoClient<F>,
    store: MarketCapStore,
}

impl Downloader<ReqwestBlockingFetcher> {
    pub fn from_config(config: DownloaderConfig) -> Result<Self, RunError> {
        let fetcher = ReqwestBlockingFetcher::new(config.http_timeout_ms)?;
        Self::with_fetcher(config, fetcher)
    }
}

impl<F: HttpFetcher> Downloader<F> {
    pub fn with_fetcher(config: DownloaderConfig, fetcher: F) -> Result<Self, RunError> {
        let store = MarketCapStore::open(&config.destination)?;
        let client = CoinGeckoClient::new(
            fetcher,
            config.api_base_url.clone(),
            RateGate::per_second(config.rate_limit_per_sec),
            config.retry,
        );
        Ok(Self {
            config,
            client,
            store,
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub fn store(&self) -> &MarketCapStore {
        &self.store
    }

    pub fn resolve(&self) -> Result<CoinMapping, RunError> {
        Ok(resolve_coin_mapping(&self.config.reference_table, &self.client)?)
    }

    pub fn run(
        &self,
        window: DaysWindow,
        cancel: &CancellationFlag,
    ) -> Result<RunSummary, RunError> {
        info!(
            component = "downloader",
            event = "run.start",
            window = ?window,
            destination = %self.config.destination.display(),
            rate_limit_per_sec = self.config.rate_limit_per_sec,
            max_attempts = self.config.retry.max_attempts,
            workers = self.config.workers
        );
        let mapping = self.resolve()?;
        Ok(self.process_all(&mapping, window, cancel))
    }

    pub fn process_all(
        &self,
        mapping: &CoinMapping,
        window: DaysWindow,
        cancel: &CancellationFlag,
    ) -> RunSummary {
        let started = Instant::now();
        let coins: Vec<(&str, &str)> = mapping.iter().collect();
        let total = coins.len();
        let workers = self.config.workers.clamp(1, total.max(1));

        let next = AtomicUsize::new(0);
        let processed = AtomicUsize::new(0);
        let succeeded = AtomicUsize::new(0);
        let failures = Mutex::new(Vec::<CoinFailure>::new());

        let work = || loop {
            if cancel.is_cancelled() {
                break;
            }
            let idx = next.fetch_add(1, Ordering::SeqCst);
            let Some(&(symbol, coin_id)) = coins.get(idx) else {
                break;
            };

            match self.process_coin(symbol, coin_id, window) {
                Ok(_) => {
                    succeeded.fetch_add(1, Ordering::SeqCst);
                }
                Err(reason) => {
                    warn!(
                        component = "downloader",
                        event = "coin.failed",
                        symbol,
                        coin_id,
                        reason = %reason
                    );
                    failures
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(CoinFailure {
                            symbol: symbol.to_string(),
                            coin_id: coin_id.to_string(),
                            reason,
                        });
                }
            }

            let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
            if done % PROGRESS_EVERY == 0 {
                info!(
                    component = "downloader",
                    event = "run.progress",
                    processed = done,
                    total
                );
            }
        };

        if workers == 1 {
            work();
        } else {
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&work);
                }
            });
        }

        let mut failed = failures
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failed.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let attempted = processed.into_inner();
        let summary = RunSummary {
            window,
            total,
            succeeded: succeeded.into_inner(),
            failed,
            not_attempted: total.saturating_sub(attempted),
            elapsed: started.elapsed(),
        };

        if summary.not_attempted > 0 {
            warn!(
                component = "downloader",
                event = "run.cancelled",
                processed = attempted,
                not_attempted = summary.not_attempted
            );
        }
        info!(
            component = "downloader",
            event = "run.finish",
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            not_attempted = summary.not_attempted,
            failed_coin_ids = ?summary.failed_coin_ids(),
            elapsed_ms = summary.elapsed.as_millis() as u64
        );

        summary
    }

    /// Fetches one coin and merges its points into its own history file, then
    /// into the per-date universe files.
    ///
    /// The coin file is written first, so every date present in a universe
    /// file is also present in that coin's file even when a universe write
    /// fails part way through.
    pub fn process_coin(
        &self,
        symbol: &str,
        coin_id: &str,
        window: DaysWindow,
    ) -> Result<CoinHistorySeries, CoinFailureReason> {
        info!(
            component = "downloader",
            event = "coin.start",
            symbol,
            coin_id
        );

        let raw = match self.client.fetch_market_caps(coin_id, window) {
            FetchOutcome::Success(raw) => raw,
            FetchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                return Err(CoinFailureReason::ExhaustedRetries {
                    attempts,
                    last_error,
                })
            }
        };

        let series = CoinHistorySeries {
            symbol: symbol.to_string(),
            coin_id: coin_id.to_string(),
            points: normalize(&raw, self.config.date_zone).map_err(CoinFailureReason::Normalize)?,
        };

        let write_err = |err: StoreError| CoinFailureReason::Write(err.to_string());
        let report = self
            .store
            .merge_write(symbol, series.coin_lines())
            .map_err(write_err)?;
        for (date_key, line) in series.universe_lines() {
            self.store.merge_write(&date_key, [line]).map_err(write_err)?;
        }

        info!(
            component = "downloader",
            event = "coin.done",
            symbol,
            coin_id,
            points = series.points.len(),
            history_lines = report.lines_written,
            conflicts = report.conflicts
        );
        Ok(series)
    }
}
