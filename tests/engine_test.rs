use async_trait::async_trait;
use candlebot::engine::{AddOutcome, AnomalyKind, Engine, EngineError, EngineEvent, IngestStatus};
use candlebot::execution::aggregator::window_start;
use candlebot::execution::{ExecutionGateway, GatewayError, OrderRequest, PaperGateway};
use candlebot::risk::Rejection;
use candlebot::*;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

struct FailingGateway;

#[async_trait]
impl ExecutionGateway for FailingGateway {
    async fn submit(&self, _request: &OrderRequest) -> std::result::Result<String, GatewayError> {
        Err(GatewayError::Transport("connection reset".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

fn config() -> AppConfig {
    AppConfig {
        symbols: vec!["BTCUSDT".to_string()],
        sma_short_window: 2,
        sma_long_window: 4,
        ema_span: 3,
        ..Default::default()
    }
}

/// Start of a minute window well in the future, so the wall-clock flush
/// never closes test candles on its own
fn base_time() -> DateTime<Utc> {
    window_start(Utc::now() + Duration::hours(1), Duration::minutes(1))
}

fn raw(symbol: &str, at: DateTime<Utc>, price: Decimal) -> RawTick {
    RawTick {
        symbol: symbol.to_string(),
        price: price.to_string(),
        timestamp_ms: at.timestamp_millis(),
    }
}

/// Round-trip through the symbol's queue so every earlier tick is processed
async fn settle(engine: &Engine, symbol: &str) {
    assert_ok!(engine.current_candle(symbol).await);
}

/// One tick per minute, plus a tick that finalizes the last candle
async fn feed_closes(engine: &Engine, base: DateTime<Utc>, closes: &[i64]) {
    for (i, close) in closes.iter().enumerate() {
        let at = base + Duration::minutes(i as i64);
        let status = engine.ingest(raw("BTCUSDT", at, Decimal::from(*close))).await;
        assert_eq!(status, IngestStatus::Queued);
    }
    let at = base + Duration::minutes(closes.len() as i64);
    let last = closes.last().copied().unwrap_or(1);
    engine.ingest(raw("BTCUSDT", at, Decimal::from(last))).await;
    settle(engine, "BTCUSDT").await;
}

async fn next_matching(
    events: &mut broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_ticks_build_one_candle() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let mut events = engine.subscribe();
    let base = base_time();

    engine.ingest(raw("BTCUSDT", base, dec!(100))).await;
    engine.ingest(raw("BTCUSDT", base + Duration::seconds(20), dec!(101))).await;
    engine.ingest(raw("BTCUSDT", base + Duration::seconds(40), dec!(99))).await;
    settle(&engine, "BTCUSDT").await;

    assert!(engine.candles("BTCUSDT", 10).unwrap().is_empty());
    let current = engine.current_candle("BTCUSDT").await.unwrap().unwrap();
    assert!(!current.finalized);
    assert_eq!(current.tick_count, 3);

    engine.ingest(raw("BTCUSDT", base + Duration::minutes(1), dec!(102))).await;
    settle(&engine, "BTCUSDT").await;

    let candles = engine.candles("BTCUSDT", 10).unwrap();
    assert_eq!(candles.len(), 1);
    let candle = &candles[0];
    assert_eq!(
        (candle.open, candle.high, candle.low, candle.close),
        (dec!(100), dec!(101), dec!(99), dec!(99))
    );
    assert_eq!(candle.open_time, base);
    assert_eq!(candle.close_time, base + Duration::minutes(1));

    match next_matching(&mut events, |e| matches!(e, EngineEvent::CandleFinalized(_))).await {
        EngineEvent::CandleFinalized(message) => {
            assert!(message.is_finalized);
            assert_eq!(message.symbol, "BTCUSDT");
            assert_eq!(message.close, dec!(99));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(engine.latest_tick("btcusdt").unwrap().price, dec!(102));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_candles_are_ordered_most_recent_first() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    feed_closes(&engine, base, &[1, 2, 3, 4, 5]).await;

    let candles = engine.candles("BTCUSDT", 3).unwrap();
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    assert_eq!(closes, vec![dec!(5), dec!(4), dec!(3)]);
    assert!(candles
        .windows(2)
        .all(|w| w[0].open_time - w[1].open_time == Duration::minutes(1)));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_add_symbol_is_idempotent() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();

    assert_eq!(engine.add_symbol("BTCUSDT").unwrap(), AddOutcome::AlreadyTracked);
    assert_eq!(engine.add_symbol("ethusdt").unwrap(), AddOutcome::Added);
    assert_eq!(engine.add_symbol("ETHUSDT").unwrap(), AddOutcome::AlreadyTracked);
    assert_err!(engine.add_symbol("ETH/USDT"));
    assert_eq!(engine.symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_anomalies_are_dropped_and_counted() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    assert_eq!(
        engine.ingest(raw("DOGEUSDT", base, dec!(0.1))).await,
        IngestStatus::Dropped(AnomalyKind::UntrackedSymbol)
    );

    let malformed = RawTick {
        symbol: "BTCUSDT".to_string(),
        price: "not-a-price".to_string(),
        timestamp_ms: base.timestamp_millis(),
    };
    assert_eq!(
        engine.ingest(malformed).await,
        IngestStatus::Dropped(AnomalyKind::MalformedTick)
    );

    engine.ingest(raw("BTCUSDT", base, dec!(100))).await;
    engine.ingest(raw("BTCUSDT", base + Duration::minutes(1), dec!(101))).await;
    // Belongs to the finalized minute-0 window
    engine.ingest(raw("BTCUSDT", base + Duration::seconds(30), dec!(500))).await;
    settle(&engine, "BTCUSDT").await;

    let candles = engine.candles("BTCUSDT", 10).unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].high, dec!(100));

    let anomalies = engine.anomalies();
    assert_eq!(anomalies.untracked_symbol_ticks, 1);
    assert_eq!(anomalies.malformed_ticks, 1);
    assert_eq!(anomalies.late_ticks, 1);

    let status = engine.status().unwrap();
    assert_eq!(status.anomalies.total(), 3);
    assert_eq!(status.symbols, vec!["BTCUSDT".to_string()]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_crossover_opens_both_variants() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    feed_closes(&engine, base, &[100, 99, 98, 97, 96, 110]).await;

    let signals = engine.signals(None, None).unwrap();
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|s| s.action == Action::Buy && s.price == dec!(110)));

    let a_only = engine.signals(Some(Variant::A), None).unwrap();
    assert_eq!(a_only.len(), 1);
    assert_eq!(a_only[0].variant, Variant::A);
    assert!(engine.signals(None, Some(Action::Sell)).unwrap().is_empty());

    let positions = engine.open_positions(None);
    assert_eq!(positions.len(), 2);
    assert!(positions
        .iter()
        .all(|p| p.side == PositionSide::Long && p.entry_price == dec!(110)));

    let b = engine.open_positions(Some(Variant::B));
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].sl_price, dec!(99));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stop_loss_closes_tighter_variant_only() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let mut events = engine.subscribe();
    let base = base_time();

    // Entry at 110: A stops at 93.5, B at 99
    feed_closes(&engine, base, &[100, 99, 98, 97, 96, 110, 98]).await;

    let trades = engine.trades().unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.variant, Variant::B);
    assert_eq!(trade.reason, "stop-loss");
    assert_eq!(trade.side, OrderSide::Sell);
    assert_eq!(trade.price, dec!(98));

    let open = engine.open_positions(None);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].variant, Variant::A);
    assert_eq!(open[0].current_price, dec!(98));

    // The closing order reaches the gateway asynchronously
    let request_id = trade.request_id;
    next_matching(&mut events, |e| {
        matches!(e, EngineEvent::ExecutionCompleted(r) if r.request.id == request_id)
    })
    .await;
    let order_id = engine.order_id_for(request_id).unwrap().unwrap();
    assert!(order_id.starts_with("paper-"));
    // The stored trade carries the id the gateway answered with
    assert_eq!(engine.trades().unwrap()[0].order_id, Some(order_id));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_short_stop_closes_on_exact_touch() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    engine.ingest(raw("BTCUSDT", base, dec!(110))).await;
    let position = engine
        .submit_manual_order("BTCUSDT", Variant::B, OrderSide::Sell, None)
        .await
        .unwrap();
    assert_eq!(position.sl_price, dec!(121));

    engine.ingest(raw("BTCUSDT", base + Duration::seconds(30), dec!(121))).await;
    engine.ingest(raw("BTCUSDT", base + Duration::minutes(1), dec!(121))).await;
    settle(&engine, "BTCUSDT").await;

    let trades = engine.trades().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].position_id, position.id);
    assert_eq!(trades[0].reason, "stop-loss");
    assert_eq!(trades[0].side, OrderSide::Buy);
    assert_eq!(trades[0].price, dec!(121));
    assert!(engine.open_positions(None).is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_manual_order_lifecycle() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    assert_eq!(
        engine
            .submit_manual_order("BTCUSDT", Variant::A, OrderSide::Buy, None)
            .await
            .unwrap_err(),
        Rejection::NoPrice("BTCUSDT".to_string())
    );
    assert_eq!(
        engine
            .submit_manual_order("XRPUSDT", Variant::A, OrderSide::Buy, None)
            .await
            .unwrap_err(),
        Rejection::UnknownSymbol("XRPUSDT".to_string())
    );

    engine.ingest(raw("BTCUSDT", base, dec!(200))).await;

    let position = engine
        .submit_manual_order("BTCUSDT", Variant::A, OrderSide::Sell, None)
        .await
        .unwrap();
    assert_eq!(position.side, PositionSide::Short);
    assert_eq!(position.entry_price, dec!(200));
    assert_eq!(position.quantity, dec!(0.001));

    assert!(matches!(
        engine
            .submit_manual_order("BTCUSDT", Variant::A, OrderSide::Buy, None)
            .await,
        Err(Rejection::SlotOccupied { .. })
    ));
    assert!(matches!(
        engine
            .submit_manual_order("BTCUSDT", Variant::B, OrderSide::Buy, Some(dec!(0.5)))
            .await,
        Err(Rejection::PositionCapExceeded { .. })
    ));

    assert_eq!(
        engine.remove_symbol("BTCUSDT").await.unwrap_err(),
        Rejection::SymbolHasOpenPositions("BTCUSDT".to_string())
    );

    engine.ingest(raw("BTCUSDT", base + Duration::seconds(10), dec!(190))).await;
    let trade = engine.close_position(position.id).await.unwrap();
    assert_eq!(trade.reason, "manual");
    assert_eq!(trade.price, dec!(190));
    assert_eq!(trade.realized_pnl, dec!(0.01));

    assert_eq!(
        engine.close_position(position.id).await.unwrap_err(),
        Rejection::PositionNotFound(position.id)
    );

    assert_ok!(engine.remove_symbol("BTCUSDT").await);
    assert!(engine.symbols().is_empty());
    // The in-progress candle was finalized on removal
    assert_eq!(engine.candles("BTCUSDT", 10).unwrap().len(), 1);
    assert_eq!(
        engine.ingest(raw("BTCUSDT", base + Duration::minutes(1), dec!(1))).await,
        IngestStatus::Dropped(AnomalyKind::UntrackedSymbol)
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_execution_failure_keeps_book_position() {
    let engine = Engine::start(config(), Arc::new(FailingGateway)).unwrap();
    let mut events = engine.subscribe();
    let base = base_time();

    engine.ingest(raw("BTCUSDT", base, dec!(100))).await;
    let position = engine
        .submit_manual_order("BTCUSDT", Variant::B, OrderSide::Buy, None)
        .await
        .unwrap();

    match next_matching(&mut events, |e| matches!(e, EngineEvent::ExecutionFailed(_))).await {
        EngineEvent::ExecutionFailed(report) => {
            assert_eq!(report.request.position_id, position.id);
            assert!(report.order_id().is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let failures = engine.execution_failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].request.position_id, position.id);

    let open = engine.open_positions(Some(Variant::B));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, position.id);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let config = AppConfig {
        channel_capacity: 0,
        ..config()
    };

    let result = Engine::start(config, Arc::new(PaperGateway::new()));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[tokio::test]
async fn test_shutdown_finalizes_in_progress_candles() {
    let engine = Engine::start(config(), Arc::new(PaperGateway::new())).unwrap();
    let base = base_time();

    engine.ingest(raw("BTCUSDT", base, dec!(100))).await;
    engine.ingest(raw("BTCUSDT", base + Duration::seconds(5), dec!(105))).await;
    engine.shutdown().await;

    let candles = engine.candles("BTCUSDT", 10).unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].close, dec!(105));
    assert!(engine.symbols().is_empty());
}
