use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorSnapshot;
use crate::models::{Action, SignalStrength};

/// Configuration for signal generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    pub ema_span: usize,
    /// Relative SMA spread above which a crossover counts as STRONG
    pub strong_spread_pct: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            short_ma_period: 5,
            long_ma_period: 20,
            ema_span: 12,
            strong_spread_pct: 0.002,
        }
    }
}

/// Detect an SMA crossover between two consecutive snapshots
///
/// Only the crossing edge fires: a short SMA that stays above the long SMA
/// produces `Hold` on every candle after the one where it crossed.
pub fn detect_crossover(previous: &IndicatorSnapshot, current: &IndicatorSnapshot) -> Action {
    let (Some(prev_short), Some(prev_long), Some(short), Some(long)) = (
        previous.sma_short,
        previous.sma_long,
        current.sma_short,
        current.sma_long,
    ) else {
        return Action::Hold;
    };

    if prev_short <= prev_long && short > long {
        Action::Buy
    } else if prev_short >= prev_long && short < long {
        Action::Sell
    } else {
        Action::Hold
    }
}

/// STRONG when the SMA spread is wide relative to price, or when price sits
/// on the crossover's side of the EMA
pub fn classify_strength(
    action: Action,
    snapshot: &IndicatorSnapshot,
    config: &SignalConfig,
) -> SignalStrength {
    let price = snapshot.price.to_f64().unwrap_or_default();
    let spread_pct = match (snapshot.sma_short, snapshot.sma_long) {
        (Some(short), Some(long)) if price > 0.0 => (short - long).abs() / price,
        _ => 0.0,
    };

    let ema_agrees = snapshot.ema.is_some_and(|ema| match action {
        Action::Buy => price > ema,
        Action::Sell => price < ema,
        Action::Hold => false,
    });

    if spread_pct > config.strong_spread_pct || ema_agrees {
        SignalStrength::Strong
    } else {
        SignalStrength::Moderate
    }
}
