use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::execution::executor::ExecutionReport;
use crate::execution::position_manager::Position;
use crate::models::{CandleMessage, Signal, Trade, Variant};
use crate::risk::Rejection;

/// Kinds of input anomaly the engine drops and counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MalformedTick,
    LateTick,
    UntrackedSymbol,
    DuplicateCandle,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::MalformedTick => write!(f, "malformed tick"),
            AnomalyKind::LateTick => write!(f, "late tick"),
            AnomalyKind::UntrackedSymbol => write!(f, "untracked symbol"),
            AnomalyKind::DuplicateCandle => write!(f, "duplicate candle"),
        }
    }
}

/// Live state delta pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CandleFinalized(CandleMessage),
    SignalGenerated(Signal),
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed {
        position: Position,
        trade: Trade,
    },
    RiskRejected {
        symbol: String,
        variant: Variant,
        rejection: Rejection,
    },
    ExecutionCompleted(ExecutionReport),
    ExecutionFailed(ExecutionReport),
    Anomaly {
        kind: AnomalyKind,
        symbol: Option<String>,
        detail: String,
    },
    SymbolAdded {
        symbol: String,
    },
    SymbolRemoved {
        symbol: String,
    },
}

#[derive(Debug, Default)]
pub struct AnomalyCounters {
    malformed_ticks: AtomicU64,
    late_ticks: AtomicU64,
    untracked_symbol_ticks: AtomicU64,
    duplicate_candles: AtomicU64,
}

/// Point-in-time copy of [`AnomalyCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalySnapshot {
    pub malformed_ticks: u64,
    pub late_ticks: u64,
    pub untracked_symbol_ticks: u64,
    pub duplicate_candles: u64,
}

impl AnomalySnapshot {
    pub fn total(&self) -> u64 {
        self.malformed_ticks
            + self.late_ticks
            + self.untracked_symbol_ticks
            + self.duplicate_candles
    }
}

impl AnomalyCounters {
    pub fn record(&self, kind: AnomalyKind) {
        let counter = match kind {
            AnomalyKind::MalformedTick => &self.malformed_ticks,
            AnomalyKind::LateTick => &self.late_ticks,
            AnomalyKind::UntrackedSymbol => &self.untracked_symbol_ticks,
            AnomalyKind::DuplicateCandle => &self.duplicate_candles,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AnomalySnapshot {
        AnomalySnapshot {
            malformed_ticks: self.malformed_ticks.load(Ordering::Relaxed),
            late_ticks: self.late_ticks.load(Ordering::Relaxed),
            untracked_symbol_ticks: self.untracked_symbol_ticks.load(Ordering::Relaxed),
            duplicate_candles: self.duplicate_candles.load(Ordering::Relaxed),
        }
    }
}
