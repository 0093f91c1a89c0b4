use super::{
    signals::{classify_strength, detect_crossover, SignalConfig},
    Strategy, StrategyDecision,
};
use crate::indicators::{IndicatorConfig, IndicatorUpdate};
use crate::models::Action;

/// SMA crossover strategy with EMA confirmation for strength
///
/// - BUY when the short SMA crosses above the long SMA
/// - SELL when it crosses below
/// - STRONG when the spread is wide or price agrees with the EMA
#[derive(Debug, Clone)]
pub struct CrossoverStrategy {
    config: SignalConfig,
}

impl CrossoverStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Indicator periods this strategy reads
    pub fn indicator_config(&self) -> IndicatorConfig {
        IndicatorConfig {
            sma_short_window: self.config.short_ma_period,
            sma_long_window: self.config.long_ma_period,
            ema_span: self.config.ema_span,
        }
    }
}

impl Default for CrossoverStrategy {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

impl Strategy for CrossoverStrategy {
    fn evaluate(&self, update: &IndicatorUpdate) -> StrategyDecision {
        let current = &update.current;

        let Some(previous) = update.previous.as_ref() else {
            return StrategyDecision::hold(current.price, "First candle, no previous snapshot");
        };
        if !previous.is_ready() || !current.is_ready() {
            return StrategyDecision::hold(current.price, "Indicators not ready");
        }

        let action = detect_crossover(previous, current);
        let reason = match action {
            Action::Buy => "SMA short crossed above SMA long",
            Action::Sell => "SMA short crossed below SMA long",
            Action::Hold => return StrategyDecision::hold(current.price, "No crossover"),
        };

        StrategyDecision {
            action,
            strength: classify_strength(action, current, &self.config),
            price: current.price,
            reason: reason.to_string(),
        }
    }

    fn name(&self) -> &str {
        "CrossoverStrategy"
    }
}
