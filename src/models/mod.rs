use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Raw tick as delivered by a market-data collaborator
///
/// Nothing here is trusted: the symbol may be badly formatted, the price
/// may not parse and the timestamp may be garbage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTick {
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "p")]
    pub price: String,
    /// Milliseconds since the Unix epoch
    #[serde(alias = "T", alias = "E")]
    pub timestamp_ms: i64,
}

/// Normalized price tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// OHLC candle over `[open_time, close_time)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub tick_count: u64,
    pub finalized: bool,
}

impl Candle {
    /// Wire form of a finalized candle for subscribers
    pub fn to_message(&self) -> CandleMessage {
        CandleMessage {
            symbol: self.symbol.clone(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            open_time: self.open_time,
            close_time: self.close_time,
            is_finalized: self.finalized,
        }
    }
}

/// Candle update pushed to stream subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandleMessage {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub is_finalized: bool,
}

/// Strategy/risk variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::A, Variant::B];
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::A => write!(f, "A"),
            Variant::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Variant::A),
            "B" => Ok(Variant::B),
            other => Err(format!("Unknown variant: '{}'. Use 'A' or 'B'", other)),
        }
    }
}

/// Trading action derived from a crossover
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStrength {
    Strong,
    Moderate,
}

/// Trading signal, one record per variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub variant: Variant,
    pub action: Action,
    pub price: Decimal,
    pub strength: SignalStrength,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position on this side
    pub fn entry_order(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position on this side
    pub fn exit_order(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Closed-position record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub variant: Variant,
    /// Order request that carried this close to the exchange
    pub request_id: Uuid,
    /// Exchange order id, filled in once the gateway accepts the request
    pub order_id: Option<String>,
    pub realized_pnl: Decimal,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
