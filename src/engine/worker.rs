use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::pipeline::{PipelineEvent, SymbolPipeline};
use super::store::EngineState;
use crate::execution::position_manager::{Position, RiskEvent};
use crate::models::{Candle, OrderSide, Tick, Trade, Variant};
use crate::risk::Rejection;

/// How often a pipeline checks for a silent candle
const FLUSH_CHECK_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Messages accepted by a symbol worker
pub enum Command {
    Tick(Tick),
    ManualOrder {
        variant: Variant,
        side: OrderSide,
        quantity: Option<Decimal>,
        reply: oneshot::Sender<Result<Position, Rejection>>,
    },
    ClosePosition {
        position_id: Uuid,
        reply: oneshot::Sender<Result<Trade, Rejection>>,
    },
    CurrentCandle {
        reply: oneshot::Sender<Option<Candle>>,
    },
    /// Finalize and exit; without `force` this is refused while positions
    /// are open
    Stop {
        force: bool,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
}

/// Single-writer loop for one symbol
///
/// Owns the pipeline outright; everything else reaches it through `rx`.
pub async fn run(
    mut pipeline: SymbolPipeline,
    mut rx: mpsc::Receiver<Command>,
    state: EngineState,
    flush_grace: Duration,
) {
    let symbol = pipeline.symbol().to_string();
    let mut flush_timer = tokio::time::interval(FLUSH_CHECK_PERIOD);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(symbol = %symbol, "Symbol pipeline started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    let events = pipeline.force_finalize();
                    state.apply(&symbol, events);
                    break;
                };

                if !handle(&mut pipeline, command, &state) {
                    break;
                }
            }
            _ = flush_timer.tick() => {
                let events = pipeline.flush(Utc::now(), flush_grace);
                state.apply(&symbol, events);
            }
        }
    }

    tracing::info!(symbol = %symbol, "Symbol pipeline stopped");
}

/// Returns false once the worker should exit
fn handle(pipeline: &mut SymbolPipeline, command: Command, state: &EngineState) -> bool {
    let symbol = pipeline.symbol().to_string();

    match command {
        Command::Tick(tick) => {
            let events = pipeline.on_tick(tick);
            if let Some(tick) = pipeline.last_tick() {
                state.record_tick(tick);
            }
            state.apply(&symbol, events);
        }
        Command::ManualOrder {
            variant,
            side,
            quantity,
            reply,
        } => {
            let result = match pipeline.manual_order(variant, side, quantity, Utc::now()) {
                Ok((position, event)) => {
                    state.apply(&symbol, vec![event]);
                    Ok(position)
                }
                Err(rejection) => {
                    tracing::warn!(
                        symbol = %symbol,
                        variant = %variant,
                        "Manual order rejected: {}",
                        rejection
                    );
                    Err(rejection)
                }
            };
            let _ = reply.send(result);
        }
        Command::ClosePosition { position_id, reply } => {
            let result = match pipeline.close_position(position_id, Utc::now()) {
                Ok(event) => {
                    let trade = match &event {
                        PipelineEvent::Risk(RiskEvent::Closed { trade, .. }) => Some(trade.clone()),
                        _ => None,
                    };
                    state.apply(&symbol, vec![event]);
                    trade.ok_or(Rejection::PositionNotFound(position_id))
                }
                Err(rejection) => Err(rejection),
            };
            let _ = reply.send(result);
        }
        Command::CurrentCandle { reply } => {
            let _ = reply.send(pipeline.current_candle());
        }
        Command::Stop { force, reply } => {
            if !force && pipeline.has_open_positions() {
                let _ = reply.send(Err(Rejection::SymbolHasOpenPositions(symbol)));
                return true;
            }

            let events = pipeline.force_finalize();
            state.apply(&symbol, events);
            let _ = reply.send(Ok(()));
            return false;
        }
    }

    true
}
