use crate::models::Candle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Thread-safe history of finalized candles
///
/// Maintains a rolling window of candles for each symbol. Symbol pipelines
/// append, queries read copies.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per symbol
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Append a finalized candle
    ///
    /// Returns `Ok(false)` without storing when the candle does not close
    /// after the last stored one for its symbol.
    pub fn add_candle(&self, candle: Candle) -> Result<bool, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let symbol_candles = data.entry(candle.symbol.clone()).or_default();

        if symbol_candles
            .back()
            .is_some_and(|last| candle.close_time <= last.close_time)
        {
            return Ok(false);
        }

        symbol_candles.push_back(candle);

        // Remove oldest if exceeds max
        while symbol_candles.len() > self.max_candles {
            symbol_candles.pop_front();
        }

        Ok(true)
    }

    /// Up to `limit` candles for a symbol, most recent first
    pub fn latest_first(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(symbol)
            .map(|deque| deque.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    /// Get count of candles for a symbol
    pub fn candle_count(&self, symbol: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(symbol).map(|d| d.len()).unwrap_or(0))
    }
}
