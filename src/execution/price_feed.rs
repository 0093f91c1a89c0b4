use std::sync::Arc;
use std::time::Duration;

use crate::api::BinanceTickerClient;
use crate::engine::{Engine, IngestStatus};

/// Polls the ticker endpoint for every tracked symbol and feeds the engine
///
/// The symbol set is re-read from the engine on every round, so symbols
/// added or removed at runtime are picked up without a restart.
pub struct PriceFeedManager {
    client: BinanceTickerClient,
    engine: Arc<Engine>,
    poll_interval: Duration,
}

impl PriceFeedManager {
    pub fn new(client: BinanceTickerClient, engine: Arc<Engine>, poll_interval: Duration) -> Self {
        Self {
            client,
            engine,
            poll_interval,
        }
    }

    /// Fetch one tick per tracked symbol; returns how many were queued
    pub async fn poll_once(&self) -> usize {
        let mut queued = 0;

        for symbol in self.engine.symbols() {
            match self.client.fetch_tick(&symbol).await {
                Ok(raw) => {
                    if self.engine.ingest(raw).await == IngestStatus::Queued {
                        queued += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Failed to fetch price: {}", e);
                }
            }
        }

        queued
    }

    /// Poll forever; cancel by dropping or aborting the task
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "Price feed started (every {}ms)",
            self.poll_interval.as_millis()
        );

        loop {
            interval.tick().await;
            let queued = self.poll_once().await;
            tracing::debug!("Queued {} ticks", queued);
        }
    }
}
