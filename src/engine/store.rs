use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::events::{AnomalyCounters, AnomalyKind, EngineEvent};
use super::pipeline::PipelineEvent;
use crate::execution::executor::ExecutionDispatcher;
use crate::execution::position_manager::{Position, RiskEvent};
use crate::execution::CandleBuffer;
use crate::models::{Signal, Tick, Trade, Variant};
use uuid::Uuid;

/// Append-only history that keeps the newest `capacity` entries
#[derive(Clone)]
pub struct History<T> {
    entries: Arc<RwLock<VecDeque<T>>>,
    capacity: usize,
}

impl<T: Clone> History<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
        }
    }

    pub fn push(&self, entry: T) -> Result<(), String> {
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    /// Entries matching `filter`, oldest first
    pub fn filtered(&self, filter: impl Fn(&T) -> bool) -> Result<Vec<T>, String> {
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        Ok(entries.iter().filter(|e| filter(*e)).cloned().collect())
    }

    /// Apply `change` to the newest entry matching `filter`
    pub fn update_latest(
        &self,
        filter: impl Fn(&T) -> bool,
        change: impl FnOnce(&mut T),
    ) -> Result<bool, String> {
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        match entries.iter_mut().rev().find(|e| filter(*e)) {
            Some(entry) => {
                change(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize, String> {
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}

/// Read side shared by all symbol pipelines
///
/// Pipelines are the only writers. Open positions are published as `Arc`
/// snapshots and replaced wholesale on every change.
#[derive(Clone)]
pub struct EngineState {
    pub candles: CandleBuffer,
    pub signals: History<Signal>,
    pub trades: History<Trade>,
    pub positions: Arc<DashMap<(String, Variant), Arc<Position>>>,
    pub latest_ticks: Arc<DashMap<String, Tick>>,
    pub anomalies: Arc<AnomalyCounters>,
    pub events: broadcast::Sender<EngineEvent>,
    pub dispatcher: ExecutionDispatcher,
}

impl EngineState {
    pub fn emit(&self, event: EngineEvent) {
        // Having no subscribers is not an error
        let _ = self.events.send(event);
    }

    pub fn record_anomaly(&self, kind: AnomalyKind, symbol: Option<&str>, detail: String) {
        self.anomalies.record(kind);
        tracing::debug!(kind = %kind, symbol = ?symbol, "Dropped input: {}", detail);
        self.emit(EngineEvent::Anomaly {
            kind,
            symbol: symbol.map(str::to_string),
            detail,
        });
    }

    pub fn record_tick(&self, tick: &Tick) {
        self.latest_ticks.insert(tick.symbol.clone(), tick.clone());
    }

    /// Publish pipeline output to stores, the gateway and subscribers
    pub fn apply(&self, symbol: &str, events: Vec<PipelineEvent>) {
        for event in events {
            match event {
                PipelineEvent::LateTick { window } => self.record_anomaly(
                    AnomalyKind::LateTick,
                    Some(symbol),
                    format!("tick for closed window {}", window),
                ),
                PipelineEvent::DuplicateCandle(candle) => self.record_anomaly(
                    AnomalyKind::DuplicateCandle,
                    Some(symbol),
                    format!("candle closing at {} already processed", candle.close_time),
                ),
                PipelineEvent::CandleFinalized(candle) => {
                    tracing::info!(
                        symbol = %candle.symbol,
                        open = %candle.open,
                        high = %candle.high,
                        low = %candle.low,
                        close = %candle.close,
                        ticks = candle.tick_count,
                        "Candle finalized"
                    );
                    let message = candle.to_message();
                    match self.candles.add_candle(candle) {
                        Ok(true) => self.emit(EngineEvent::CandleFinalized(message)),
                        Ok(false) => self.record_anomaly(
                            AnomalyKind::DuplicateCandle,
                            Some(symbol),
                            format!("candle closing at {} already stored", message.close_time),
                        ),
                        Err(e) => tracing::error!("Failed to store candle: {}", e),
                    }
                }
                PipelineEvent::Signal(signal) => {
                    tracing::info!(
                        symbol = %signal.symbol,
                        variant = %signal.variant,
                        action = %signal.action,
                        strength = ?signal.strength,
                        price = %signal.price,
                        "Signal: {}",
                        signal.reason
                    );
                    if let Err(e) = self.signals.push(signal.clone()) {
                        tracing::error!("Failed to record signal: {}", e);
                    }
                    self.emit(EngineEvent::SignalGenerated(signal));
                }
                PipelineEvent::Risk(risk) => self.apply_risk(symbol, risk),
            }
        }
    }

    fn apply_risk(&self, symbol: &str, event: RiskEvent) {
        match event {
            RiskEvent::Opened { position, order } => {
                self.publish_position(&position);
                self.dispatcher.dispatch(order);
                self.emit(EngineEvent::PositionOpened(position));
            }
            RiskEvent::Repriced { position } => {
                self.publish_position(&position);
                self.emit(EngineEvent::PositionUpdated(position));
            }
            RiskEvent::Closed {
                position,
                trade,
                order,
            } => {
                self.positions
                    .remove(&(position.symbol.clone(), position.variant));
                if let Err(e) = self.trades.push(trade.clone()) {
                    tracing::error!("Failed to record trade: {}", e);
                }
                let trades = self.trades.clone();
                self.dispatcher.dispatch_then(order, move |report| {
                    if let Some(order_id) = report.order_id() {
                        attach_order_id(&trades, report.request.id, order_id);
                    }
                });
                self.emit(EngineEvent::PositionClosed { position, trade });
            }
            RiskEvent::Rejected { variant, rejection } => {
                self.emit(EngineEvent::RiskRejected {
                    symbol: symbol.to_string(),
                    variant,
                    rejection,
                });
            }
        }
    }

    fn publish_position(&self, position: &Position) {
        self.positions.insert(
            (position.symbol.clone(), position.variant),
            Arc::new(position.clone()),
        );
    }
}

fn attach_order_id(trades: &History<Trade>, request_id: Uuid, order_id: &str) {
    let result = trades.update_latest(
        |t| t.request_id == request_id,
        |t| t.order_id = Some(order_id.to_string()),
    );
    match result {
        Ok(true) => {}
        // Already rolled out of the history
        Ok(false) => tracing::debug!(%request_id, "No stored trade for order {}", order_id),
        Err(e) => tracing::error!("Failed to attach order id: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperGateway;
    use crate::models::Candle;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn state() -> EngineState {
        let (events, _) = broadcast::channel(64);
        let dispatcher = ExecutionDispatcher::new(
            Arc::new(PaperGateway::new()),
            events.clone(),
            std::time::Duration::from_secs(1),
            16,
        );
        EngineState {
            candles: CandleBuffer::new(10),
            signals: History::new(10),
            trades: History::new(10),
            positions: Arc::new(DashMap::new()),
            latest_ticks: Arc::new(DashMap::new()),
            anomalies: Arc::default(),
            events,
            dispatcher,
        }
    }

    fn candle(close: Decimal) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle {
            symbol: "BTCUSDT".to_string(),
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
    fn test_stored_candle_is_not_replaced() {
        let state = state();
        let mut events = state.events.subscribe();

        state.apply("BTCUSDT", vec![PipelineEvent::CandleFinalized(candle(dec!(100)))]);
        state.apply("BTCUSDT", vec![PipelineEvent::CandleFinalized(candle(dec!(200)))]);

        let stored = state.candles.latest_first("BTCUSDT", 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, dec!(100));
        assert_eq!(state.anomalies.snapshot().duplicate_candles, 1);

        assert!(matches!(events.try_recv(), Ok(EngineEvent::CandleFinalized(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::Anomaly {
                kind: AnomalyKind::DuplicateCandle,
                ..
            })
        ));
    }

    #[test]
    fn test_update_latest_changes_newest_match() {
        let history = History::new(10);
        for i in [1, 2, 1] {
            history.push((i, false)).unwrap();
        }

        assert!(history.update_latest(|e| e.0 == 1, |e| e.1 = true).unwrap());
        assert!(!history.update_latest(|e| e.0 == 9, |e| e.1 = true).unwrap());
        assert_eq!(
            history.filtered(|_| true).unwrap(),
            vec![(1, false), (2, false), (1, true)]
        );
    }

    #[test]
    fn test_history_keeps_newest() {
        let history = History::new(3);
        for i in 0..5 {
            history.push(i).unwrap();
        }

        assert_eq!(history.len().unwrap(), 3);
        assert_eq!(history.filtered(|_| true).unwrap(), vec![2, 3, 4]);
        assert_eq!(history.filtered(|n| n % 2 == 0).unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_history_empty() {
        let history: History<u32> = History::new(10);
        assert!(history.is_empty().unwrap());
    }
}
