use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Variant;

/// Structured refusal returned to callers; state is left unchanged
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum Rejection {
    #[error("Variant {variant} already has an open position for {symbol}")]
    SlotOccupied { symbol: String, variant: Variant },

    #[error(
        "Position cap exceeded for {symbol}: open {open} + requested {requested} > cap {cap}"
    )]
    PositionCapExceeded {
        symbol: String,
        open: Decimal,
        requested: Decimal,
        cap: Decimal,
    },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("No price observed yet for {0}")]
    NoPrice(String),

    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("Symbol {0} still has open positions")]
    SymbolHasOpenPositions(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(Decimal),

    #[error("Symbol pipeline for {0} is not running")]
    PipelineStopped(String),
}

/// Per-symbol exposure limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionLimits {
    /// Quantity used for signal-driven opens
    pub trade_quantity: Decimal,
    /// Aggregate open quantity per symbol across variants
    pub max_position_size: Decimal,
}

impl Default for PositionLimits {
    fn default() -> Self {
        Self {
            trade_quantity: Decimal::new(1, 3),
            max_position_size: Decimal::new(1, 2),
        }
    }
}

impl PositionLimits {
    /// Check that opening `requested` on top of `open` stays within the cap
    pub fn check(&self, symbol: &str, open: Decimal, requested: Decimal) -> Result<(), Rejection> {
        if requested <= Decimal::ZERO {
            return Err(Rejection::InvalidQuantity(requested));
        }

        if open + requested > self.max_position_size {
            return Err(Rejection::PositionCapExceeded {
                symbol: symbol.to_string(),
                open,
                requested,
                cap: self.max_position_size,
            });
        }

        Ok(())
    }
}
