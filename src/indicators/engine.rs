use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::moving_average::{Ema, Sma};
use crate::models::Candle;

/// Indicator periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorConfig {
    pub sma_short_window: usize,
    pub sma_long_window: usize,
    pub ema_span: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            sma_short_window: 5,
            sma_long_window: 20,
            ema_span: 12,
        }
    }
}

/// Indicator values after one finalized candle
///
/// `None` means the indicator is not ready yet. Averages are approximate;
/// `price` is the exact close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub close_time: DateTime<Utc>,
    pub price: Decimal,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub ema: Option<f64>,
}

impl IndicatorSnapshot {
    /// Both SMAs are available
    pub fn is_ready(&self) -> bool {
        self.sma_short.is_some() && self.sma_long.is_some()
    }
}

/// Previous and current snapshot for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorUpdate {
    pub previous: Option<IndicatorSnapshot>,
    pub current: IndicatorSnapshot,
}

#[derive(Debug, Clone)]
struct IndicatorState {
    sma_short: Sma,
    sma_long: Sma,
    ema: Ema,
    last: Option<IndicatorSnapshot>,
}

impl IndicatorState {
    fn new(config: &IndicatorConfig) -> Self {
        Self {
            sma_short: Sma::new(config.sma_short_window),
            sma_long: Sma::new(config.sma_long_window),
            ema: Ema::new(config.ema_span),
            last: None,
        }
    }
}

/// Rolling SMA/EMA state per symbol
///
/// Updated once per finalized candle. Callers are responsible for never
/// feeding the same candle twice.
#[derive(Debug)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    states: HashMap<String, IndicatorState>,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn update(&mut self, candle: &Candle) -> IndicatorUpdate {
        let config = self.config;
        let state = self
            .states
            .entry(candle.symbol.clone())
            .or_insert_with(|| IndicatorState::new(&config));

        let close = candle.close.to_f64().unwrap_or_default();
        let current = IndicatorSnapshot {
            close_time: candle.close_time,
            price: candle.close,
            sma_short: state.sma_short.update(close),
            sma_long: state.sma_long.update(close),
            ema: Some(state.ema.update(close)),
        };

        let previous = state.last.replace(current.clone());

        tracing::debug!(
            symbol = %candle.symbol,
            close = %candle.close,
            sma_short = ?current.sma_short,
            sma_long = ?current.sma_long,
            ema = ?current.ema,
            "Indicators updated"
        );

        IndicatorUpdate { previous, current }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, minute: i64, close: Decimal) -> Candle {
        let open_time =
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        Candle {
            symbol: symbol.to_string(),
            open_time,
            close_time: open_time + Duration::minutes(1),
            open: close,
            high: close,
            low: close,
            close,
            tick_count: 1,
            finalized: true,
        }
    }

    #[test]
    fn test_not_ready_until_windows_fill() {
        let mut engine = IndicatorEngine::new(IndicatorConfig {
            sma_short_window: 2,
            sma_long_window: 3,
            ema_span: 5,
        });

        let first = engine.update(&candle("BTCUSDT", 0, dec!(100)));
        assert!(first.previous.is_none());
        assert!(!first.current.is_ready());
        assert_eq!(first.current.ema, Some(100.0));

        let second = engine.update(&candle("BTCUSDT", 1, dec!(102)));
        assert_eq!(second.current.sma_short, Some(101.0));
        assert!(second.current.sma_long.is_none());

        let third = engine.update(&candle("BTCUSDT", 2, dec!(104)));
        assert!(third.current.is_ready());
        assert_eq!(third.current.sma_long, Some(102.0));
        assert_eq!(third.previous.unwrap().price, dec!(102));
    }

    #[test]
    fn test_sma_over_known_closes() {
        let mut engine = IndicatorEngine::new(IndicatorConfig {
            sma_short_window: 5,
            sma_long_window: 6,
            ema_span: 3,
        });

        let mut last = None;
        for (i, close) in [dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)]
            .into_iter()
            .enumerate()
        {
            last = Some(engine.update(&candle("BTCUSDT", i as i64, close)));
        }

        assert_eq!(last.unwrap().current.sma_short, Some(3.0));
    }

    #[test]
    fn test_symbols_have_separate_state() {
        let mut engine = IndicatorEngine::new(IndicatorConfig::default());
        engine.update(&candle("BTCUSDT", 0, dec!(100)));
        let eth = engine.update(&candle("ETHUSDT", 0, dec!(10)));
        assert!(eth.previous.is_none());
        assert_eq!(eth.current.ema, Some(10.0));

        let btc = engine.update(&candle("BTCUSDT", 1, dec!(100)));
        assert_eq!(btc.previous.unwrap().ema, Some(100.0));
        assert!((btc.current.ema.unwrap() - 100.0).abs() < 1e-9);
    }
}
