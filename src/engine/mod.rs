//! Dual-variant trading engine.
//!
//! One worker task per symbol owns that symbol's aggregator, indicators and
//! both variant position managers. The [`Engine`] routes ticks and commands
//! to workers and serves queries from the shared read side.

pub mod events;
pub mod pipeline;
pub mod store;
mod worker;

pub use events::{AnomalyKind, AnomalySnapshot, EngineEvent};
pub use pipeline::{PipelineEvent, SymbolPipeline};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError};
use crate::execution::executor::{ExecutionDispatcher, ExecutionGateway, ExecutionReport};
use crate::execution::normalizer::{normalize, normalize_symbol, TickError};
use crate::execution::position_manager::Position;
use crate::execution::CandleBuffer;
use crate::models::{Action, Candle, OrderSide, RawTick, Signal, Tick, Trade, Variant};
use crate::risk::Rejection;
use crate::strategy::{CrossoverStrategy, Strategy};
use store::{EngineState, History};
use worker::Command;

const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Symbol(#[from] TickError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddOutcome {
    Added,
    AlreadyTracked,
}

/// What happened to one raw tick handed to [`Engine::ingest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Queued,
    Dropped(AnomalyKind),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    pub symbols: Vec<String>,
    pub open_positions: usize,
    pub trades: usize,
    pub anomalies: AnomalySnapshot,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

struct Worker {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct Engine {
    config: AppConfig,
    strategy: Arc<dyn Strategy>,
    state: EngineState,
    workers: DashMap<String, Worker>,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Build an engine with no symbols; must be called inside a tokio runtime
    pub fn new(config: AppConfig, gateway: Arc<dyn ExecutionGateway>) -> Result<Self, EngineError> {
        let strategy: Arc<dyn Strategy> = Arc::new(CrossoverStrategy::new(config.signal_config()));
        Self::with_strategy(config, gateway, strategy)
    }

    pub fn with_strategy(
        config: AppConfig,
        gateway: Arc<dyn ExecutionGateway>,
        strategy: Arc<dyn Strategy>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let dispatcher = ExecutionDispatcher::new(
            gateway,
            events.clone(),
            config.execution_timeout(),
            config.max_execution_history,
        );

        let state = EngineState {
            candles: CandleBuffer::new(config.max_candles_history),
            signals: History::new(config.max_signal_history),
            trades: History::new(config.max_trade_history),
            positions: Arc::new(DashMap::new()),
            latest_ticks: Arc::new(DashMap::new()),
            anomalies: Arc::default(),
            events,
            dispatcher,
        };

        tracing::info!(
            strategy = strategy.name(),
            interval_secs = config.candle_interval_secs,
            "Engine created"
        );

        Ok(Self {
            config,
            strategy,
            state,
            workers: DashMap::new(),
            started_at: Utc::now(),
        })
    }

    /// Build an engine and start a pipeline for every configured symbol
    pub fn start(
        config: AppConfig,
        gateway: Arc<dyn ExecutionGateway>,
    ) -> Result<Self, EngineError> {
        let engine = Self::new(config, gateway)?;
        for symbol in engine.config.symbols.clone() {
            engine.add_symbol(&symbol)?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events.subscribe()
    }

    /// Tracked symbols, sorted
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Start tracking a symbol; idempotent
    pub fn add_symbol(&self, symbol: &str) -> Result<AddOutcome, TickError> {
        let symbol = normalize_symbol(symbol)?;

        match self.workers.entry(symbol.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(AddOutcome::AlreadyTracked),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.config.channel_capacity);
                let pipeline =
                    SymbolPipeline::new(symbol.clone(), &self.config, self.strategy.clone());
                let task = tokio::spawn(worker::run(
                    pipeline,
                    rx,
                    self.state.clone(),
                    self.config.flush_grace(),
                ));
                slot.insert(Worker { tx, task });

                tracing::info!(symbol = %symbol, "Tracking symbol");
                self.state.emit(EngineEvent::SymbolAdded { symbol });
                Ok(AddOutcome::Added)
            }
        }
    }

    /// Stop tracking a symbol, finalizing its in-progress candle
    pub async fn remove_symbol(&self, symbol: &str) -> Result<(), Rejection> {
        let symbol = tracked_name(symbol)?;
        let tx = self.sender(&symbol)?;

        let (reply, response) = oneshot::channel();
        self.request(&symbol, &tx, Command::Stop { force: false, reply }, response)
            .await??;

        if let Some((_, worker)) = self.workers.remove(&symbol) {
            if let Err(e) = worker.task.await {
                tracing::error!(symbol = %symbol, "Pipeline task failed: {}", e);
            }
        }

        tracing::info!(symbol = %symbol, "Stopped tracking symbol");
        self.state.emit(EngineEvent::SymbolRemoved { symbol });
        Ok(())
    }

    /// Normalize a raw tick and queue it on its symbol's pipeline
    pub async fn ingest(&self, raw: RawTick) -> IngestStatus {
        let tick = match normalize(&raw) {
            Ok(tick) => tick,
            Err(e) => {
                self.state
                    .record_anomaly(AnomalyKind::MalformedTick, None, e.to_string());
                return IngestStatus::Dropped(AnomalyKind::MalformedTick);
            }
        };

        let Ok(tx) = self.sender(&tick.symbol) else {
            self.state.record_anomaly(
                AnomalyKind::UntrackedSymbol,
                Some(&tick.symbol),
                "symbol is not tracked".to_string(),
            );
            return IngestStatus::Dropped(AnomalyKind::UntrackedSymbol);
        };

        let symbol = tick.symbol.clone();
        if tx.send(Command::Tick(tick)).await.is_err() {
            self.state.record_anomaly(
                AnomalyKind::UntrackedSymbol,
                Some(&symbol),
                "symbol pipeline stopped".to_string(),
            );
            return IngestStatus::Dropped(AnomalyKind::UntrackedSymbol);
        }

        IngestStatus::Queued
    }

    /// Open a position outside the signal flow, at the last tick price
    pub async fn submit_manual_order(
        &self,
        symbol: &str,
        variant: Variant,
        side: OrderSide,
        quantity: Option<Decimal>,
    ) -> Result<Position, Rejection> {
        let symbol = tracked_name(symbol)?;
        let tx = self.sender(&symbol)?;

        let (reply, response) = oneshot::channel();
        let command = Command::ManualOrder {
            variant,
            side,
            quantity,
            reply,
        };
        self.request(&symbol, &tx, command, response).await?
    }

    /// Close an open position by id at its symbol's last tick price
    pub async fn close_position(&self, position_id: Uuid) -> Result<Trade, Rejection> {
        let symbol = self
            .state
            .positions
            .iter()
            .find(|entry| entry.value().id == position_id)
            .map(|entry| entry.key().0.clone())
            .ok_or(Rejection::PositionNotFound(position_id))?;
        let tx = self.sender(&symbol)?;

        let (reply, response) = oneshot::channel();
        let command = Command::ClosePosition { position_id, reply };
        self.request(&symbol, &tx, command, response).await?
    }

    /// Finalized candles, most recent first
    pub fn candles(&self, symbol: &str, limit: usize) -> crate::Result<Vec<Candle>> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.state.candles.latest_first(&symbol, limit)?)
    }

    /// In-progress candle of a tracked symbol
    pub async fn current_candle(&self, symbol: &str) -> Result<Option<Candle>, Rejection> {
        let symbol = tracked_name(symbol)?;
        let tx = self.sender(&symbol)?;

        let (reply, response) = oneshot::channel();
        self.request(&symbol, &tx, Command::CurrentCandle { reply }, response)
            .await
    }

    pub fn latest_tick(&self, symbol: &str) -> Option<Tick> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.state.latest_ticks.get(&symbol).map(|t| t.clone())
    }

    /// Open positions, oldest first, optionally for one variant
    pub fn open_positions(&self, variant: Option<Variant>) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .state
            .positions
            .iter()
            .filter(|entry| variant.map_or(true, |v| entry.key().1 == v))
            .map(|entry| Position::clone(entry.value()))
            .collect();
        positions.sort_by(|a, b| {
            a.opened_at
                .cmp(&b.opened_at)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.variant.cmp(&b.variant))
        });
        positions
    }

    /// Signal history, oldest first
    pub fn signals(
        &self,
        variant: Option<Variant>,
        action: Option<Action>,
    ) -> crate::Result<Vec<Signal>> {
        Ok(self.state.signals.filtered(|s| {
            variant.map_or(true, |v| s.variant == v) && action.map_or(true, |a| s.action == a)
        })?)
    }

    /// Trade history, oldest first
    pub fn trades(&self) -> crate::Result<Vec<Trade>> {
        Ok(self.state.trades.filtered(|_| true)?)
    }

    /// Exchange order id for an order request, once the gateway answered
    pub fn order_id_for(&self, request_id: Uuid) -> crate::Result<Option<String>> {
        let report = self.state.dispatcher.log().get(request_id)?;
        Ok(report.and_then(|r| r.order_id().map(str::to_string)))
    }

    /// Orders the gateway rejected or timed out on, among recent submissions
    pub fn execution_failures(&self) -> crate::Result<Vec<ExecutionReport>> {
        Ok(self.state.dispatcher.log().failures()?)
    }

    pub fn anomalies(&self) -> AnomalySnapshot {
        self.state.anomalies.snapshot()
    }

    pub fn status(&self) -> crate::Result<EngineStatus> {
        let now = Utc::now();
        Ok(EngineStatus {
            symbols: self.symbols(),
            open_positions: self.state.positions.len(),
            trades: self.state.trades.len()?,
            anomalies: self.anomalies(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
        })
    }

    /// Finalize every in-progress candle and stop all pipelines
    pub async fn shutdown(&self) {
        let symbols = self.symbols();
        tracing::info!("Shutting down {} symbol pipelines", symbols.len());

        for symbol in symbols {
            let Some((_, worker)) = self.workers.remove(&symbol) else {
                continue;
            };

            let (reply, response) = oneshot::channel();
            if worker
                .tx
                .send(Command::Stop { force: true, reply })
                .await
                .is_ok()
            {
                let _ = response.await;
            }
            if let Err(e) = worker.task.await {
                tracing::error!(symbol = %symbol, "Pipeline task failed: {}", e);
            }
        }
    }

    fn sender(&self, symbol: &str) -> Result<mpsc::Sender<Command>, Rejection> {
        self.workers
            .get(symbol)
            .map(|w| w.tx.clone())
            .ok_or_else(|| Rejection::UnknownSymbol(symbol.to_string()))
    }

    async fn request<T>(
        &self,
        symbol: &str,
        tx: &mpsc::Sender<Command>,
        command: Command,
        response: oneshot::Receiver<T>,
    ) -> Result<T, Rejection> {
        tx.send(command)
            .await
            .map_err(|_| Rejection::PipelineStopped(symbol.to_string()))?;
        response
            .await
            .map_err(|_| Rejection::PipelineStopped(symbol.to_string()))
    }
}

fn tracked_name(symbol: &str) -> Result<String, Rejection> {
    normalize_symbol(symbol).map_err(|_| Rejection::UnknownSymbol(symbol.to_string()))
}
