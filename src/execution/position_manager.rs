use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::executor::OrderRequest;
use crate::config::ReversalPolicy;
use crate::models::{Action, Candle, PositionSide, Trade, Variant};
use crate::risk::{PositionLimits, Rejection};
use crate::strategy::StrategyDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    StopLoss,
    SignalReversal,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::SignalReversal => write!(f, "signal-reversal"),
            ExitReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub variant: Variant,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub current_price: Decimal,
    pub sl_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<Decimal>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.pnl_at(self.current_price)
    }

    /// Unrealized P&L as a fraction of entry notional
    pub fn pnl_pct(&self) -> Decimal {
        let notional = self.entry_price * self.quantity;
        if notional.is_zero() {
            return Decimal::ZERO;
        }
        self.unrealized_pnl() / notional
    }

    /// Boundary inclusive: touching the stop closes the position
    pub fn stop_breached(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= self.sl_price,
            PositionSide::Short => price >= self.sl_price,
        }
    }
}

/// Parameters that distinguish one variant from another
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    pub variant: Variant,
    pub stop_loss_pct: Decimal,
    pub trade_quantity: Decimal,
    pub reversal_policy: ReversalPolicy,
}

impl RiskParams {
    /// Exact in decimal, so a tick printed at the stop compares equal to it
    pub fn stop_price(&self, side: PositionSide, entry_price: Decimal) -> Decimal {
        match side {
            PositionSide::Long => entry_price * (Decimal::ONE - self.stop_loss_pct),
            PositionSide::Short => entry_price * (Decimal::ONE + self.stop_loss_pct),
        }
    }
}

/// State change produced by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum RiskEvent {
    Opened {
        position: Position,
        order: OrderRequest,
    },
    Repriced {
        position: Position,
    },
    Closed {
        position: Position,
        trade: Trade,
        order: OrderRequest,
    },
    Rejected {
        variant: Variant,
        rejection: Rejection,
    },
}

/// Position state machine for one (symbol, variant) slot
///
/// The slot holds at most one open position. Every change replaces the
/// stored `Position` with a new value; closed positions leave the slot and
/// live on only in the emitted events.
pub struct PositionManager {
    symbol: String,
    params: RiskParams,
    open: Option<Position>,
}

impl PositionManager {
    pub fn new(symbol: impl Into<String>, params: RiskParams) -> Self {
        Self {
            symbol: symbol.into(),
            params,
            open: None,
        }
    }

    pub fn variant(&self) -> Variant {
        self.params.variant
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    pub fn open_position(&self) -> Option<&Position> {
        self.open.as_ref()
    }

    /// Quantity currently held in this slot
    pub fn open_quantity(&self) -> Decimal {
        self.open.as_ref().map_or(Decimal::ZERO, |p| p.quantity)
    }

    /// Apply one finalized candle and the strategy decision made on it
    ///
    /// `other_open` is the quantity the other variant holds on this symbol.
    pub fn on_candle(
        &mut self,
        candle: &Candle,
        decision: &StrategyDecision,
        limits: &PositionLimits,
        other_open: Decimal,
    ) -> Vec<RiskEvent> {
        let mut events = Vec::new();
        let at = candle.close_time;

        if let Some(position) = self.open.as_ref() {
            let repriced = Position {
                current_price: candle.close,
                ..position.clone()
            };

            if repriced.stop_breached(candle.close) {
                tracing::warn!(
                    symbol = %self.symbol,
                    variant = %self.params.variant,
                    price = %candle.close,
                    sl_price = %repriced.sl_price,
                    "Stop-loss breached"
                );
                self.open = Some(repriced);
                // A stop-loss close consumes the candle
                events.extend(self.close_open(candle.close, ExitReason::StopLoss, at));
                return events;
            }

            self.open = Some(repriced.clone());
            events.push(RiskEvent::Repriced { position: repriced });
        }

        let Some(wanted) = side_for(decision.action) else {
            return events;
        };

        match self.open.as_ref().map(|p| p.side) {
            Some(side) if side == wanted => {}
            Some(_) => {
                events.extend(self.close_open(decision.price, ExitReason::SignalReversal, at));
                if self.params.reversal_policy == ReversalPolicy::Flip {
                    events.push(self.try_open(wanted, decision, limits, other_open, at));
                }
            }
            None => events.push(self.try_open(wanted, decision, limits, other_open, at)),
        }

        events
    }

    fn try_open(
        &mut self,
        side: PositionSide,
        decision: &StrategyDecision,
        limits: &PositionLimits,
        other_open: Decimal,
        at: DateTime<Utc>,
    ) -> RiskEvent {
        let reason = format!("{} {}", decision.action, decision.reason);
        let quantity = self.params.trade_quantity;
        match self.open(side, decision.price, quantity, limits, other_open, at, reason) {
            Ok((position, order)) => RiskEvent::Opened { position, order },
            Err(rejection) => RiskEvent::Rejected {
                variant: self.params.variant,
                rejection,
            },
        }
    }

    /// Open a position in the empty slot
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        side: PositionSide,
        price: Decimal,
        quantity: Decimal,
        limits: &PositionLimits,
        other_open: Decimal,
        at: DateTime<Utc>,
        reason: String,
    ) -> Result<(Position, OrderRequest), Rejection> {
        if self.open.is_some() {
            let rejection = Rejection::SlotOccupied {
                symbol: self.symbol.clone(),
                variant: self.params.variant,
            };
            tracing::warn!("Open rejected: {}", rejection);
            return Err(rejection);
        }

        if let Err(rejection) = limits.check(&self.symbol, other_open, quantity) {
            tracing::warn!(variant = %self.params.variant, "Open rejected: {}", rejection);
            return Err(rejection);
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            variant: self.params.variant,
            side,
            entry_price: price,
            quantity,
            current_price: price,
            sl_price: self.params.stop_price(side, price),
            opened_at: at,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
        };

        let order = OrderRequest {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            side: side.entry_order(),
            quantity,
            variant: self.params.variant,
            position_id: position.id,
            reference_price: price,
            reason,
            created_at: at,
        };

        tracing::info!(
            "Opened {:?} {} variant {} @ ${:.2} (qty {}, stop ${:.2})",
            side,
            self.symbol,
            self.params.variant,
            price,
            quantity,
            position.sl_price
        );

        self.open = Some(position.clone());
        Ok((position, order))
    }

    /// Close the open position if its id matches
    pub fn close(
        &mut self,
        position_id: Uuid,
        price: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<RiskEvent, Rejection> {
        match self.open.as_ref() {
            Some(p) if p.id == position_id => {}
            _ => return Err(Rejection::PositionNotFound(position_id)),
        }

        self.close_open(price, reason, at)
            .ok_or(Rejection::PositionNotFound(position_id))
    }

    fn close_open(
        &mut self,
        price: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Option<RiskEvent> {
        let position = self.open.take()?;
        let pnl = position.pnl_at(price);

        let closed = Position {
            current_price: price,
            closed_at: Some(at),
            exit_price: Some(price),
            exit_reason: Some(reason),
            realized_pnl: Some(pnl),
            ..position
        };

        let order = OrderRequest {
            id: Uuid::new_v4(),
            symbol: closed.symbol.clone(),
            side: closed.side.exit_order(),
            quantity: closed.quantity,
            variant: closed.variant,
            position_id: closed.id,
            reference_price: price,
            reason: reason.to_string(),
            created_at: at,
        };

        let trade = Trade {
            id: Uuid::new_v4(),
            position_id: closed.id,
            symbol: closed.symbol.clone(),
            side: order.side,
            price,
            quantity: closed.quantity,
            variant: closed.variant,
            request_id: order.id,
            order_id: None,
            realized_pnl: pnl,
            reason: reason.to_string(),
            timestamp: at,
        };

        tracing::info!(
            "Closed {:?} {} variant {} @ ${:.2} ({}, P&L ${:.4})",
            closed.side,
            closed.symbol,
            closed.variant,
            price,
            reason,
            pnl
        );

        Some(RiskEvent::Closed {
            position: closed,
            trade,
            order,
        })
    }
}

fn side_for(action: Action) -> Option<PositionSide> {
    match action {
        Action::Buy => Some(PositionSide::Long),
        Action::Sell => Some(PositionSide::Short),
        Action::Hold => None,
    }
}
