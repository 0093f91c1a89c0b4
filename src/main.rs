use anyhow::Context;
use candlebot::api::BinanceTickerClient;
use candlebot::config::AppConfig;
use candlebot::engine::{Engine, EngineEvent};
use candlebot::execution::{ExecutionGateway, PaperGateway, PriceFeedManager};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "candlebot", about = "Dual-variant candle trading engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream prices, build candles and trade both variants
    Run {
        /// TOML file layered over the built-in defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Symbols to track, overriding the configuration
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Fill orders locally instead of sending them anywhere
        #[arg(long)]
        paper: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            symbols,
            paper,
        } => run(config, symbols, paper).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("candlebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(
    config_path: Option<PathBuf>,
    symbols: Vec<String>,
    paper: bool,
) -> anyhow::Result<()> {
    let mut config =
        AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    if !symbols.is_empty() {
        config.symbols = symbols;
    }

    if !paper {
        tracing::warn!("No live gateway is configured; falling back to paper execution");
    }
    let gateway: Arc<dyn ExecutionGateway> = Arc::new(PaperGateway::new());

    tracing::info!("candlebot starting");
    tracing::info!("  Symbols: {}", config.symbols.join(", "));
    tracing::info!("  Candle interval: {}s", config.candle_interval_secs);
    tracing::info!(
        "  SMA {}/{} EMA {}",
        config.sma_short_window,
        config.sma_long_window,
        config.ema_span
    );
    tracing::info!(
        "  Stop-loss A {:.1}% / B {:.1}%",
        config.variants.a.stop_loss_pct * Decimal::ONE_HUNDRED,
        config.variants.b.stop_loss_pct * Decimal::ONE_HUNDRED
    );
    tracing::info!("  Reversal policy: {:?}", config.reversal_policy);

    let client = BinanceTickerClient::new(&config.feed).context("Failed to build ticker client")?;
    let poll_interval = Duration::from_millis(config.feed.poll_interval_ms);

    let engine = Arc::new(Engine::start(config, gateway).context("Failed to start engine")?);

    let event_task = {
        let events = engine.subscribe();
        tokio::spawn(log_events(events))
    };

    let mut feed_task = {
        let feed = PriceFeedManager::new(client, engine.clone(), poll_interval);
        tokio::spawn(feed.run())
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = &mut feed_task => {
            tracing::error!("Price feed exited: {:?}", result);
        }
    }

    feed_task.abort();
    engine.shutdown().await;

    match engine.status() {
        Ok(status) => tracing::info!(
            "Stopped after {}s: {} open positions, {} trades, {} anomalies",
            status.uptime_secs,
            status.open_positions,
            status.trades,
            status.anomalies.total()
        ),
        Err(e) => tracing::error!("Failed to read final status: {}", e),
    }

    event_task.abort();
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::PositionClosed { trade, .. }) => tracing::info!(
                "Trade {} {} variant {} @ ${:.2} ({}, P&L ${:.4})",
                trade.side,
                trade.symbol,
                trade.variant,
                trade.price,
                trade.reason,
                trade.realized_pnl
            ),
            Ok(EngineEvent::ExecutionFailed(report)) => tracing::error!(
                "Execution failed for {} {}: book and exchange may diverge",
                report.request.symbol,
                report.request.side
            ),
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Event logger lagged, missed {} events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
