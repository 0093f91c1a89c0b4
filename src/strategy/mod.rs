// Trading strategy module
pub mod crossover;
pub mod signals;

use rust_decimal::Decimal;

use crate::indicators::IndicatorUpdate;
use crate::models::{Action, SignalStrength};

pub use crossover::CrossoverStrategy;
pub use signals::SignalConfig;

/// Outcome of evaluating one finalized candle
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDecision {
    pub action: Action,
    pub strength: SignalStrength,
    pub price: Decimal,
    pub reason: String,
}

impl StrategyDecision {
    pub fn hold(price: Decimal, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            strength: SignalStrength::Moderate,
            price,
            reason: reason.into(),
        }
    }
}

/// Base trait for signal strategies
///
/// Implementations are stateless: everything they need is in the previous
/// and current indicator snapshots.
pub trait Strategy: Send + Sync {
    /// Generate a decision for the candle behind `update`
    fn evaluate(&self, update: &IndicatorUpdate) -> StrategyDecision;

    /// Get strategy name
    fn name(&self) -> &str;
}
