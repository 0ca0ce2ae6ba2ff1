//! Supported crypto currencies from the symbol-properties table, joined with
//! the CoinGecko catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::coingecko::{CatalogEntry, CoinGeckoClient, FetchError, FetchOutcome, HttpFetcher};

pub const MIN_FIELDS: usize = 5;
pub const CRYPTO_ASSET_CLASS: &str = "crypto";

const MARKET_FIELD: usize = 0;
const TICKER_FIELD: usize = 1;
const ASSET_CLASS_FIELD: usize = 2;
const QUOTE_CURRENCY_FIELD: usize = 4;

/// A trading pair split into lower-cased currency codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub base_currency: String,
    pub quote_currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    TooFewFields { found: usize },
    NotCrypto { asset_class: String },
    Undecomposable { ticker: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOutcome {
    Pair(SymbolRecord),
    Skip(SkipReason),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to read reference table {path}: {source}")]
    ReferenceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed reference table: {0}")]
    ReferenceCsv(#[from] csv::Error),
    #[error("coin catalog fetch failed after {attempts} attempt(s): {last_error}")]
    Catalog { attempts: u32, last_error: FetchError },
}

/// Lower-cased currency code to CoinGecko coin id. Built once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinMapping {
    entries: BTreeMap<String, String>,
}

impl CoinMapping {
    /// Inner join of the supported codes with the catalog. Catalog symbols are
    /// matched as returned; when several coins share a symbol the later one wins.
    pub fn from_catalog(supported: &BTreeSet<String>, catalog: &[CatalogEntry]) -> Self {
        let mut entries = BTreeMap::new();
        for coin in catalog {
            if !supported.contains(&coin.symbol) {
                continue;
            }
            if let Some(previous) = entries.insert(coin.symbol.clone(), coin.id.clone()) {
                debug!(
                    component = "symbols",
                    event = "resolve.duplicate_symbol",
                    symbol = %coin.symbol,
                    previous_id = %previous,
                    id = %coin.id
                );
            }
        }
        Self { entries }
    }

    pub fn get(&self, symbol: &str) -> Option<&str> {
        self.entries.get(symbol).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(symbol, coin id)` pairs in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(symbol, id)| (symbol.as_str(), id.as_str()))
    }
}

impl FromIterator<(String, String)> for CoinMapping {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub fn classify_row(record: &StringRecord) -> RowOutcome {
    if record.len() < MIN_FIELDS {
        return RowOutcome::Skip(SkipReason::TooFewFields {
            found: record.len(),
        });
    }

    let asset_class = record.get(ASSET_CLASS_FIELD).unwrap_or_default();
    if asset_class != CRYPTO_ASSET_CLASS {
        return RowOutcome::Skip(SkipReason::NotCrypto {
            asset_class: asset_class.to_string(),
        });
    }

    let market = record.get(MARKET_FIELD).unwrap_or_default();
    let ticker = record.get(TICKER_FIELD).unwrap_or_default();
    let quote_hint = record.get(QUOTE_CURRENCY_FIELD);

    match decompose_pair(ticker, quote_hint).or_else(|| split_prefixed(market, ticker)) {
        Some(pair) => RowOutcome::Pair(pair),
        None => RowOutcome::Skip(SkipReason::Undecomposable {
            ticker: ticker.to_string(),
        }),
    }
}

/// Splits a pair ticker such as `BTCUSD` into base and quote codes.
///
/// With a quote currency hint the ticker must end with it. Without one only
/// six-letter tickers are split, three and three.
pub fn decompose_pair(ticker: &str, quote_hint: Option<&str>) -> Option<SymbolRecord> {
    let ticker = ticker.trim();
    if ticker.is_empty() || !ticker.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let split_at = match quote_hint.map(str::trim).filter(|quote| !quote.is_empty()) {
        Some(quote) => {
            let matches = ticker.len() > quote.len()
                && ticker
                    .to_ascii_lowercase()
                    .ends_with(&quote.to_ascii_lowercase());
            if !matches {
                return None;
            }
            ticker.len() - quote.len()
        }
        None if ticker.len() == 6 => 3,
        None => return None,
    };

    let (base, quote) = ticker.split_at(split_at);
    Some(SymbolRecord {
        base_currency: base.to_ascii_lowercase(),
        quote_currency: quote.to_ascii_lowercase(),
    })
}

// Rows carrying the full pair in the first field and the base in the second.
fn split_prefixed(pair: &str, base: &str) -> Option<SymbolRecord> {
    let (pair, base) = (pair.trim(), base.trim());
    if base.is_empty()
        || pair.len() <= base.len()
        || !pair.chars().all(|c| c.is_ascii_alphanumeric())
        || !pair[..base.len()].eq_ignore_ascii_case(base)
    {
        return None;
    }

    Some(SymbolRecord {
        base_currency: base.to_ascii_lowercase(),
        quote_currency: pair[base.len()..].to_ascii_lowercase(),
    })
}

/// Every base and quote code of the crypto rows, lower-cased.
pub fn parse_supported_currencies<R: Read>(reader: R) -> Result<BTreeSet<String>, ResolveError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut supported = BTreeSet::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        match classify_row(&record?) {
            RowOutcome::Pair(pair) => {
                supported.insert(pair.base_currency);
                supported.insert(pair.quote_currency);
            }
            RowOutcome::Skip(reason) => {
                skipped += 1;
                if let SkipReason::Undecomposable { ticker } = &reason {
                    debug!(
                        component = "symbols",
                        event = "resolve.row_skipped",
                        ticker = %ticker
                    );
                }
            }
        }
    }

    debug!(
        component = "symbols",
        event = "resolve.reference_parsed",
        currencies = supported.len(),
        skipped_rows = skipped
    );
    Ok(supported)
}

pub fn read_supported_currencies(path: &Path) -> Result<BTreeSet<String>, ResolveError> {
    let file = File::open(path).map_err(|source| ResolveError::ReferenceIo {
        path: path.to_path_buf(),
        source,
    })?;
    parse_supported_currencies(file)
}

/// Reads the reference table, fetches the catalog once and joins them.
/// Both failures are fatal for the run.
pub fn resolve_coin_mapping<F: HttpFetcher>(
    reference_table: &Path,
    client: &CoinGeckoClient<F>,
) -> Result<CoinMapping, ResolveError> {
    let started = Instant::now();
    info!(
        component = "symbols",
        event = "resolve.start",
        reference_table = %reference_table.display()
    );

    let supported = read_supported_currencies(reference_table)?;
    info!(
        component = "symbols",
        event = "resolve.catalog.fetch",
        supported_currencies = supported.len()
    );

    let catalog = match client.fetch_catalog() {
        FetchOutcome::Success(catalog) => catalog,
        FetchOutcome::Exhausted {
            attempts,
            last_error,
        } => return Err(ResolveError::Catalog { attempts, last_error }),
    };

    let mapping = CoinMapping::from_catalog(&supported, &catalog);
    info!(
        component = "symbols",
        event = "resolve.finish",
        catalog_entries = catalog.len(),
        resolved_coins = mapping.len(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(mapping)
}
