//! Raw `market_chart` points into calendar-date keyed market caps.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coingecko::RawPoint;

pub const DATE_KEY_FORMAT: &str = "%Y%m%d";

/// Time zone used to turn epoch milliseconds into a calendar day.
///
/// UTC is the default: CoinGecko stamps daily points at midnight UTC, and
/// `Local` shifts every point to the previous day on hosts west of UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateZone {
    #[default]
    Utc,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketCapPoint {
    pub date: NaiveDate,
    pub market_cap: f64,
}

impl MarketCapPoint {
    /// `YYYYMMDD`, the per-date file key.
    pub fn date_key(&self) -> String {
        self.date.format(DATE_KEY_FORMAT).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoinHistorySeries {
    pub symbol: String,
    pub coin_id: String,
    pub points: Vec<MarketCapPoint>,
}

impl CoinHistorySeries {
    /// Lines for the per-coin file: `YYYYMMDD,marketCap`.
    pub fn coin_lines(&self) -> Vec<String> {
        self.points
            .iter()
            .map(|point| format!("{},{}", point.date_key(), point.market_cap))
            .collect()
    }

    /// `(date key, "symbol,marketCap")` pairs for the per-date universe files.
    pub fn universe_lines(&self) -> Vec<(String, String)> {
        self.points
            .iter()
            .map(|point| {
                (
                    point.date_key(),
                    format!("{},{}", self.symbol, point.market_cap),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("invalid epoch milliseconds: {0}")]
    InvalidTimestamp(i64),
}

/// Drops the trailing (still open) point and keys the rest by calendar day.
///
/// Points without a value are skipped, so the output holds at most
/// `raw.len() - 1` points; an empty or single point input yields nothing.
pub fn normalize(raw: &[RawPoint], zone: DateZone) -> Result<Vec<MarketCapPoint>, HistoryError> {
    let Some((_, settled)) = raw.split_last() else {
        return Ok(Vec::new());
    };

    settled
        .iter()
        .filter_map(|point| {
            let market_cap = point.value?;
            Some(calendar_date(point.ts_ms, zone).map(|date| MarketCapPoint { date, market_cap }))
        })
        .collect()
}

pub fn calendar_date(ts_ms: i64, zone: DateZone) -> Result<NaiveDate, HistoryError> {
    let utc: DateTime<Utc> = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(HistoryError::InvalidTimestamp(ts_ms))?;

    Ok(match zone {
        DateZone::Utc => utc.date_naive(),
        DateZone::Local => utc.with_timezone(&Local).date_naive(),
    })
}
