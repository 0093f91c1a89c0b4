//! Application configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `CANDLEBOT__*` environment variables.

use chrono::Duration;
use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::execution::position_manager::RiskParams;
use crate::indicators::IndicatorConfig;
use crate::models::Variant;
use crate::risk::PositionLimits;
use crate::strategy::SignalConfig;

const ENV_PREFIX: &str = "CANDLEBOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What happens after a position is closed by an opposing signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReversalPolicy {
    /// Stay flat until the next independent signal
    #[default]
    Flat,
    /// Immediately open the opposite side
    Flip,
}

/// Risk parameters of one variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantConfig {
    /// Fraction of entry price, e.g. 0.15 for a 15% stop
    pub stop_loss_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantsConfig {
    pub a: VariantConfig,
    pub b: VariantConfig,
}

impl VariantsConfig {
    pub fn get(&self, variant: Variant) -> &VariantConfig {
        match variant {
            Variant::A => &self.a,
            Variant::B => &self.b,
        }
    }
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            a: VariantConfig {
                stop_loss_pct: Decimal::new(15, 2),
            },
            b: VariantConfig {
                stop_loss_pct: Decimal::new(10, 2),
            },
        }
    }
}

/// REST ticker polling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub requests_per_minute: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://testnet.binance.vision/api".to_string(),
            poll_interval_ms: 1000,
            requests_per_minute: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub candle_interval_secs: u64,
    pub max_candles_history: usize,
    pub sma_short_window: usize,
    pub sma_long_window: usize,
    pub ema_span: usize,
    /// |sma_short - sma_long| / price above this makes a signal STRONG
    pub strong_spread_pct: f64,
    pub trade_quantity: Decimal,
    /// Cap on open quantity per symbol, summed over variants
    pub max_position_size: Decimal,
    pub reversal_policy: ReversalPolicy,
    /// How long past `close_time` a silent symbol's candle waits before the
    /// wall-clock flush finalizes it
    pub flush_grace_secs: u64,
    pub channel_capacity: usize,
    pub max_signal_history: usize,
    pub max_trade_history: usize,
    /// Execution reports kept for order id lookups and failure queries
    pub max_execution_history: usize,
    /// Upper bound on one gateway submission
    pub execution_timeout_ms: u64,
    pub variants: VariantsConfig,
    pub feed: FeedConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            candle_interval_secs: 60,
            max_candles_history: 100,
            sma_short_window: 5,
            sma_long_window: 20,
            ema_span: 12,
            strong_spread_pct: 0.002,
            trade_quantity: Decimal::new(1, 3),
            max_position_size: Decimal::new(1, 2),
            reversal_policy: ReversalPolicy::Flat,
            flush_grace_secs: 5,
            channel_capacity: 1024,
            max_signal_history: 1000,
            max_trade_history: 1000,
            max_execution_history: 2000,
            execution_timeout_ms: 5000,
            variants: VariantsConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (if given), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with an inline TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candle_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "candle_interval_secs must be positive".to_string(),
            ));
        }
        if self.sma_short_window == 0 || self.ema_span == 0 {
            return Err(ConfigError::Invalid(
                "indicator windows must be positive".to_string(),
            ));
        }
        if self.sma_short_window >= self.sma_long_window {
            return Err(ConfigError::Invalid(format!(
                "sma_short_window ({}) must be less than sma_long_window ({})",
                self.sma_short_window, self.sma_long_window
            )));
        }
        for variant in Variant::ALL {
            let pct = self.variants.get(variant).stop_loss_pct;
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                return Err(ConfigError::Invalid(format!(
                    "variant {} stop_loss_pct must be in (0, 1), got {}",
                    variant, pct
                )));
            }
        }
        if self.trade_quantity <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "trade_quantity must be positive".to_string(),
            ));
        }
        if self.max_position_size < self.trade_quantity {
            return Err(ConfigError::Invalid(format!(
                "max_position_size ({}) is smaller than one trade ({})",
                self.max_position_size, self.trade_quantity
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be positive".to_string(),
            ));
        }
        if self.max_execution_history == 0 {
            return Err(ConfigError::Invalid(
                "max_execution_history must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn candle_interval(&self) -> Duration {
        Duration::seconds(self.candle_interval_secs as i64)
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::seconds(self.flush_grace_secs as i64)
    }

    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn indicator_config(&self) -> IndicatorConfig {
        IndicatorConfig {
            sma_short_window: self.sma_short_window,
            sma_long_window: self.sma_long_window,
            ema_span: self.ema_span,
        }
    }

    pub fn signal_config(&self) -> SignalConfig {
        SignalConfig {
            short_ma_period: self.sma_short_window,
            long_ma_period: self.sma_long_window,
            ema_span: self.ema_span,
            strong_spread_pct: self.strong_spread_pct,
        }
    }

    pub fn limits(&self) -> PositionLimits {
        PositionLimits {
            trade_quantity: self.trade_quantity,
            max_position_size: self.max_position_size,
        }
    }

    pub fn risk_params(&self, variant: Variant) -> RiskParams {
        RiskParams {
            variant,
            stop_loss_pct: self.variants.get(variant).stop_loss_pct,
            trade_quantity: self.trade_quantity,
            reversal_policy: self.reversal_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.variants.a.stop_loss_pct, dec!(0.15));
        assert_eq!(config.variants.b.stop_loss_pct, dec!(0.10));
        assert_eq!(config.reversal_policy, ReversalPolicy::Flat);
        assert_eq!(config.candle_interval(), Duration::seconds(60));
    }

    #[test]
    fn test_toml_overrides() {
        let config = AppConfig::from_toml_str(
            r#"
            symbols = ["SOLUSDT"]
            sma_short_window = 3
            sma_long_window = 8
            reversal_policy = "flip"

            trade_quantity = 0.5
            max_position_size = 2

            [variants.b]
            stop_loss_pct = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.symbols, vec!["SOLUSDT".to_string()]);
        assert_eq!(config.sma_short_window, 3);
        assert_eq!(config.sma_long_window, 8);
        assert_eq!(config.reversal_policy, ReversalPolicy::Flip);
        assert_eq!(config.variants.b.stop_loss_pct, dec!(0.05));
        assert_eq!(config.trade_quantity, dec!(0.5));
        assert_eq!(config.max_position_size, dec!(2));
        // Untouched keys keep their defaults
        assert_eq!(config.variants.a.stop_loss_pct, dec!(0.15));
        assert_eq!(config.ema_span, 12);
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let config = AppConfig {
            sma_short_window: 20,
            sma_long_window: 5,
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be less than"));
    }

    #[test]
    fn test_rejects_bad_stop_loss() {
        let mut config = AppConfig::default();
        config.variants.a.stop_loss_pct = dec!(1.5);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("variant A"));
    }

    #[test]
    fn test_derived_component_configs() {
        let config = AppConfig::default();

        let params = config.risk_params(Variant::B);
        assert_eq!(params.stop_loss_pct, dec!(0.10));
        assert_eq!(params.trade_quantity, dec!(0.001));
        assert_eq!(config.indicator_config().sma_long_window, 20);
        assert_eq!(config.signal_config().strong_spread_pct, 0.002);
        assert_eq!(config.limits().max_position_size, dec!(0.01));
    }

    #[test]
    fn test_rejects_cap_below_trade_quantity() {
        let config = AppConfig {
            trade_quantity: dec!(1),
            max_position_size: dec!(0.5),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_channel_capacity() {
        let config = AppConfig {
            channel_capacity: 0,
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }
}
