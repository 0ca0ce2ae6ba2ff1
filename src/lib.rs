//! CoinGecko market-cap downloader.
//!
//! Resolves the crypto currencies listed in a symbol-properties table against
//! the CoinGecko coin catalog, then keeps two on-disk views of their daily
//! market caps current:
//! - `<destination>/<coin>.csv` with `YYYYMMDD,marketCap` lines
//! - `<destination>/universe/<YYYYMMDD>.csv` with `coin,marketCap` lines

mod coingecko;
mod config;
mod downloader;
mod history;
mod observability;
mod store;
mod symbols;
mod universe;

pub use coingecko::{
    CatalogEntry, CoinGeckoClient, DaysWindow, FetchError, FetchOutcome, HttpFetcher, RateGate,
    RawPoint, ReqwestBlockingFetcher, RetryPolicy, COINGECKO_COINS_BASE_URL, MAX_SPACING,
};
pub use config::{
    downloader_config_from_env, ConfigError, REFERENCE_TABLE_RELATIVE, VENDOR_DATA_NAME,
    VENDOR_NAME,
};
pub use downloader::{
    CancellationFlag, CoinFailure, CoinFailureReason, Downloader, DownloaderConfig, RunError,
    RunSummary, PROGRESS_EVERY,
};
pub use history::{
    calendar_date, normalize, CoinHistorySeries, DateZone, HistoryError, MarketCapPoint,
    DATE_KEY_FORMAT,
};
pub use observability::{
    elapsed_minutes, init_logging, log_app_exit, log_app_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use store::{route, MarketCapStore, MergeReport, StoreError, StoreTarget, UNIVERSE_DIR};
pub use symbols::{
    classify_row, decompose_pair, parse_supported_currencies, read_supported_currencies,
    resolve_coin_mapping, CoinMapping, ResolveError, RowOutcome, SkipReason, SymbolRecord,
    CRYPTO_ASSET_CLASS, MIN_FIELDS,
};
pub use universe::{pair_symbol, read_universe, select_by_market_cap, UniverseEntry, UniverseError};
