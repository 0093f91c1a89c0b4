use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{RawTick, Tick};

const MAX_SYMBOL_LEN: usize = 20;

/// Why a raw tick was rejected
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TickError {
    #[error("Empty symbol")]
    EmptySymbol,

    #[error("Invalid symbol: '{0}'")]
    InvalidSymbol(String),

    #[error("Unparseable price: '{0}'")]
    InvalidPrice(String),

    #[error("Non-positive price: {0}")]
    NonPositivePrice(String),

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

/// Canonical symbol form: trimmed, upper-case ASCII alphanumerics
pub fn normalize_symbol(symbol: &str) -> Result<String, TickError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(TickError::EmptySymbol);
    }
    if symbol.len() > MAX_SYMBOL_LEN || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(TickError::InvalidSymbol(symbol.to_string()));
    }
    Ok(symbol.to_ascii_uppercase())
}

/// Convert a raw exchange tick into a [`Tick`]
///
/// Prices stay exact decimals from here on; strings like "1e3" or "NaN"
/// never make it into the candle stream.
pub fn normalize(raw: &RawTick) -> Result<Tick, TickError> {
    let symbol = normalize_symbol(&raw.symbol)?;

    let price = Decimal::from_str(raw.price.trim())
        .map_err(|_| TickError::InvalidPrice(raw.price.clone()))?
        .normalize();
    if price <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice(raw.price.clone()));
    }

    if raw.timestamp_ms <= 0 {
        return Err(TickError::InvalidTimestamp(raw.timestamp_ms));
    }
    let timestamp = DateTime::<Utc>::from_timestamp_millis(raw.timestamp_ms)
        .ok_or(TickError::InvalidTimestamp(raw.timestamp_ms))?;

    Ok(Tick {
        symbol,
        price,
        timestamp,
    })
}
