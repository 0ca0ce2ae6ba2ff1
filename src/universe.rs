//! Reading per-date universe files and selecting coins by market cap.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: String,
    pub market_cap: f64,
}

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to read universe file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed universe line {line_no} in {path}: '{line}'")]
    MalformedLine {
        path: PathBuf,
        line_no: usize,
        line: String,
    },
}

pub fn read_universe(path: &Path) -> Result<Vec<UniverseEntry>, UniverseError> {
    let content = fs::read_to_string(path).map_err(|source| UniverseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = line
            .split_once(',')
            .and_then(|(symbol, value)| Some((symbol.trim(), value.trim().parse::<f64>().ok()?)))
            .filter(|(symbol, _)| !symbol.is_empty());
        let Some((symbol, market_cap)) = parsed else {
            return Err(UniverseError::MalformedLine {
                path: path.to_path_buf(),
                line_no: idx + 1,
                line: line.to_string(),
            });
        };
        entries.push(UniverseEntry {
            symbol: symbol.to_string(),
            market_cap,
        });
    }

    Ok(entries)
}

/// Symbols whose market cap is strictly above `threshold`, in file order.
pub fn select_by_market_cap(entries: &[UniverseEntry], threshold: f64) -> Vec<&str> {
    entries
        .iter()
        .filter(|entry| entry.market_cap > threshold)
        .map(|entry| entry.symbol.as_str())
        .collect()
}

/// USD trading pair ticker for a universe coin, e.g. `btc` -> `BTCUSD`.
pub fn pair_symbol(coin: &str) -> String {
    format!("{}USD", coin.to_ascii_uppercase())
}
