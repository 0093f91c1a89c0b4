// Technical indicators module
// Incremental SMA/EMA state fed by finalized candles

pub mod engine;
pub mod moving_average;

pub use engine::{IndicatorConfig, IndicatorEngine, IndicatorSnapshot, IndicatorUpdate};
pub use moving_average::{Ema, Sma};
