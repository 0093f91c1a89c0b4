use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::models::{Candle, Tick};

/// Result of feeding one tick to the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// First tick of a new window, no candle was closed
    Started,
    /// Tick folded into the in-progress candle
    Updated,
    /// Tick opened a later window and closed the previous candle
    Rolled { finalized: Candle },
    /// Tick belongs to a window that is already closed; dropped
    Late { window: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct SymbolWindow {
    current: Option<Candle>,
    last_finalized_open: Option<DateTime<Utc>>,
}

/// Buckets ticks into fixed-width OHLC candles per symbol
///
/// Candle boundaries depend only on tick timestamps. The in-progress candle
/// of a symbol closes when a tick for a later window arrives, or when
/// [`CandleAggregator::flush_due`] decides it has been silent long enough.
#[derive(Debug)]
pub struct CandleAggregator {
    interval: Duration,
    symbols: HashMap<String, SymbolWindow>,
}

/// Start of the window containing `timestamp`
pub fn window_start(timestamp: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = interval.num_milliseconds().max(1);
    let start_ms = timestamp.timestamp_millis().div_euclid(interval_ms) * interval_ms;
    DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(timestamp)
}

impl CandleAggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            symbols: HashMap::new(),
        }
    }

    /// Route a tick into the candle for its window
    pub fn ingest(&mut self, tick: &Tick) -> IngestOutcome {
        let open_time = window_start(tick.timestamp, self.interval);
        let interval = self.interval;
        let window = self.symbols.entry(tick.symbol.clone()).or_default();

        if window
            .last_finalized_open
            .is_some_and(|last| open_time <= last)
        {
            return IngestOutcome::Late { window: open_time };
        }

        let current_open = match window.current.as_ref() {
            Some(current) => current.open_time,
            None => {
                window.current = Some(new_candle(tick, open_time, interval));
                return IngestOutcome::Started;
            }
        };

        if open_time < current_open {
            return IngestOutcome::Late { window: open_time };
        }

        if open_time == current_open {
            if let Some(current) = window.current.as_mut() {
                current.high = current.high.max(tick.price);
                current.low = current.low.min(tick.price);
                current.close = tick.price;
                current.tick_count += 1;
            }
            return IngestOutcome::Updated;
        }

        let finalized = finalize(window);
        window.current = Some(new_candle(tick, open_time, interval));

        match finalized {
            Some(finalized) => {
                tracing::debug!(
                    symbol = %finalized.symbol,
                    open_time = %finalized.open_time,
                    ticks = finalized.tick_count,
                    "Candle closed by next-window tick"
                );
                IngestOutcome::Rolled { finalized }
            }
            None => IngestOutcome::Started,
        }
    }

    /// Finalize every in-progress candle whose window ended at least `grace`
    /// before `now`
    pub fn flush_due(&mut self, now: DateTime<Utc>, grace: Duration) -> Vec<Candle> {
        let mut flushed = Vec::new();

        for window in self.symbols.values_mut() {
            let due = window
                .current
                .as_ref()
                .is_some_and(|c| now >= c.close_time + grace);
            if due {
                if let Some(candle) = finalize(window) {
                    flushed.push(candle);
                }
            }
        }

        flushed.sort_by(|a, b| a.close_time.cmp(&b.close_time));
        flushed
    }

    /// Finalize the in-progress candle of `symbol` regardless of time
    pub fn force_finalize(&mut self, symbol: &str) -> Option<Candle> {
        self.symbols.get_mut(symbol).and_then(finalize)
    }

    /// Snapshot of the in-progress candle
    pub fn current_candle(&self, symbol: &str) -> Option<Candle> {
        self.symbols.get(symbol).and_then(|w| w.current.clone())
    }
}

fn new_candle(tick: &Tick, open_time: DateTime<Utc>, interval: Duration) -> Candle {
    Candle {
        symbol: tick.symbol.clone(),
        open_time,
        close_time: open_time + interval,
        open: tick.price,
        high: tick.price,
        low: tick.price,
        close: tick.price,
        tick_count: 1,
        finalized: false,
    }
}

fn finalize(window: &mut SymbolWindow) -> Option<Candle> {
    let mut candle = window.current.take()?;
    candle.finalized = true;
    window.last_finalized_open = Some(candle.open_time);
    Some(candle)
}
