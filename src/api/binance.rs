use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::FeedConfig;
use crate::models::RawTick;

const MAX_RETRIES: u32 = 3;

type TickerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ticker API error ({status}): {body}")]
    Api { status: StatusCode, body: String },

    #[error("Gave up after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Invalid feed configuration: {0}")]
    Config(String),
}

/// Response from /v3/ticker/price
#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

/// REST client for the Binance spot ticker endpoint
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceTickerClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<TickerRateLimiter>,
    backoff_base: Duration,
}

impl BinanceTickerClient {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let rpm = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| FeedError::Config("requests_per_minute must be positive".to_string()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the first retry delay; later retries double it
    pub fn with_backoff(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// Rate-limited GET with retry on 429 and 5xx
    async fn make_request(&self, url: &str) -> Result<reqwest::Response, FeedError> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let backoff = self.backoff_base * 2u32.pow(attempt - 1);

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        tracing::warn!(
                            "Ticker API returned {}, retrying in {:?} (attempt {}/{})",
                            status,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    // Other 4xx: the request itself is wrong
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(FeedError::Api { status, body });
                }
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "Network error: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(FeedError::Http(e)),
            }
        }

        Err(FeedError::RetriesExhausted(MAX_RETRIES))
    }

    /// Latest trade price for one symbol, stamped with receive time
    pub async fn fetch_tick(&self, symbol: &str) -> Result<RawTick, FeedError> {
        let url = format!("{}/v3/ticker/price?symbol={}", self.base_url, symbol);

        let response = self.make_request(&url).await?;
        let ticker: TickerPrice = response.json().await?;

        tracing::debug!(symbol = %ticker.symbol, price = %ticker.price, "Fetched ticker");

        Ok(RawTick {
            symbol: ticker.symbol,
            price: ticker.price,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}
