use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::execution::aggregator::{CandleAggregator, IngestOutcome};
use crate::execution::position_manager::{ExitReason, Position, PositionManager, RiskEvent};
use crate::indicators::IndicatorEngine;
use crate::models::{Action, Candle, OrderSide, PositionSide, Signal, Tick, Variant};
use crate::risk::{PositionLimits, Rejection};
use crate::strategy::Strategy;

/// What one step of a symbol pipeline produced
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    LateTick { window: DateTime<Utc> },
    CandleFinalized(Candle),
    DuplicateCandle(Candle),
    Signal(Signal),
    Risk(RiskEvent),
}

/// All per-symbol processing state, driven by a single owner
///
/// Candles reach the indicator, strategy and risk stages strictly in
/// `close_time` order; a candle whose `close_time` does not advance is
/// reported as a duplicate and goes no further.
pub struct SymbolPipeline {
    symbol: String,
    aggregator: CandleAggregator,
    indicators: IndicatorEngine,
    strategy: Arc<dyn Strategy>,
    variant_a: PositionManager,
    variant_b: PositionManager,
    limits: PositionLimits,
    last_close_time: Option<DateTime<Utc>>,
    last_tick: Option<Tick>,
}

impl SymbolPipeline {
    pub fn new(
        symbol: impl Into<String>,
        config: &AppConfig,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            aggregator: CandleAggregator::new(config.candle_interval()),
            indicators: IndicatorEngine::new(config.indicator_config()),
            strategy,
            variant_a: PositionManager::new(symbol.clone(), config.risk_params(Variant::A)),
            variant_b: PositionManager::new(symbol.clone(), config.risk_params(Variant::B)),
            limits: config.limits(),
            last_close_time: None,
            last_tick: None,
            symbol,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_tick(&self) -> Option<&Tick> {
        self.last_tick.as_ref()
    }

    pub fn current_candle(&self) -> Option<Candle> {
        self.aggregator.current_candle(&self.symbol)
    }

    pub fn manager(&self, variant: Variant) -> &PositionManager {
        match variant {
            Variant::A => &self.variant_a,
            Variant::B => &self.variant_b,
        }
    }

    /// Mutable access to one variant plus the other's open quantity
    fn manager_mut(&mut self, variant: Variant) -> (&mut PositionManager, Decimal) {
        match variant {
            Variant::A => (&mut self.variant_a, self.variant_b.open_quantity()),
            Variant::B => (&mut self.variant_b, self.variant_a.open_quantity()),
        }
    }

    pub fn open_positions(&self) -> Vec<Position> {
        Variant::ALL
            .iter()
            .filter_map(|v| self.manager(*v).open_position().cloned())
            .collect()
    }

    pub fn has_open_positions(&self) -> bool {
        Variant::ALL
            .iter()
            .any(|v| self.manager(*v).open_position().is_some())
    }

    pub fn on_tick(&mut self, tick: Tick) -> Vec<PipelineEvent> {
        match self.aggregator.ingest(&tick) {
            IngestOutcome::Late { window } => vec![PipelineEvent::LateTick { window }],
            IngestOutcome::Started | IngestOutcome::Updated => {
                self.last_tick = Some(tick);
                Vec::new()
            }
            IngestOutcome::Rolled { finalized } => {
                self.last_tick = Some(tick);
                self.process_candle(finalized)
            }
        }
    }

    /// Finalize the in-progress candle if its window ended `grace` ago
    pub fn flush(&mut self, now: DateTime<Utc>, grace: Duration) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        for candle in self.aggregator.flush_due(now, grace) {
            tracing::debug!(
                symbol = %self.symbol,
                open_time = %candle.open_time,
                "Flushed silent candle"
            );
            events.extend(self.process_candle(candle));
        }
        events
    }

    pub fn force_finalize(&mut self) -> Vec<PipelineEvent> {
        match self.aggregator.force_finalize(&self.symbol) {
            Some(candle) => self.process_candle(candle),
            None => Vec::new(),
        }
    }

    fn process_candle(&mut self, candle: Candle) -> Vec<PipelineEvent> {
        if self
            .last_close_time
            .is_some_and(|last| candle.close_time <= last)
        {
            return vec![PipelineEvent::DuplicateCandle(candle)];
        }
        self.last_close_time = Some(candle.close_time);

        let update = self.indicators.update(&candle);
        let decision = self.strategy.evaluate(&update);

        let mut events = vec![PipelineEvent::CandleFinalized(candle.clone())];

        if decision.action != Action::Hold {
            for variant in Variant::ALL {
                events.push(PipelineEvent::Signal(Signal {
                    timestamp: candle.close_time,
                    symbol: self.symbol.clone(),
                    variant,
                    action: decision.action,
                    price: decision.price,
                    strength: decision.strength,
                    reason: decision.reason.clone(),
                }));
            }
        }

        // A is evaluated first, so it wins the cap when both want to open
        for variant in Variant::ALL {
            let limits = self.limits.clone();
            let (manager, other_open) = self.manager_mut(variant);
            events.extend(
                manager
                    .on_candle(&candle, &decision, &limits, other_open)
                    .into_iter()
                    .map(PipelineEvent::Risk),
            );
        }

        events
    }

    /// Open a position at the last tick price, bypassing signals
    pub fn manual_order(
        &mut self,
        variant: Variant,
        side: OrderSide,
        quantity: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(Position, PipelineEvent), Rejection> {
        let price = self
            .last_tick
            .as_ref()
            .map(|t| t.price)
            .ok_or_else(|| Rejection::NoPrice(self.symbol.clone()))?;

        let position_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let limits = self.limits.clone();
        let (manager, other_open) = self.manager_mut(variant);
        let quantity = quantity.unwrap_or(manager.params().trade_quantity);

        let (position, order) = manager.open(
            position_side,
            price,
            quantity,
            &limits,
            other_open,
            at,
            format!("manual {}", side),
        )?;

        Ok((
            position.clone(),
            PipelineEvent::Risk(RiskEvent::Opened { position, order }),
        ))
    }

    /// Close an open position by id at the last tick price
    pub fn close_position(
        &mut self,
        position_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<PipelineEvent, Rejection> {
        let variant = Variant::ALL
            .into_iter()
            .find(|v| {
                self.manager(*v)
                    .open_position()
                    .is_some_and(|p| p.id == position_id)
            })
            .ok_or(Rejection::PositionNotFound(position_id))?;

        let last_price = self.last_tick.as_ref().map(|t| t.price);
        let (manager, _) = self.manager_mut(variant);
        let price = match (last_price, manager.open_position()) {
            (Some(price), _) => price,
            (None, Some(position)) => position.current_price,
            (None, None) => return Err(Rejection::PositionNotFound(position_id)),
        };

        manager
            .close(position_id, price, ExitReason::Manual, at)
            .map(PipelineEvent::Risk)
    }
}
