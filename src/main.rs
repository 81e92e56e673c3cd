//! LevSwap - leveraged/non-leveraged ETF swap bot
//!
//! Usage: cargo run --release
//!
//! Requires TRADING212_KEY (and TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID when the
//! notifier is enabled) in the environment or `.env`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use levswap::broker::{Broker, RateLimiter, Trading212Client};
use levswap::calendar::ExchangeCalendar;
use levswap::config::{AppConfig, LoggingConfig};
use levswap::notifier::{notify_quietly, LogNotifier, Notifier, TelegramNotifier};
use levswap::persistence::{CsvSnapshotSink, NullSnapshotSink, SnapshotSink};
use levswap::runner::PollingLoop;
use levswap::trader::Trader;

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(&logging.filter),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if logging.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.context("Failed to initialize tracing")
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load config (.env first) ──
    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting LevSwap");
    info!(config = %config.digest(), "Configuration loaded");

    // ── 2. Secrets ──
    let secrets = config.validate_env()?;

    // ── 3. Broker ──
    let limiter = Arc::new(RateLimiter::new());
    let client = Arc::new(Trading212Client::new(
        &config.broker.base_url,
        &secrets.trading212_key,
        Arc::clone(&limiter),
        Duration::from_secs(config.broker.request_timeout_secs),
    )?);
    let broker: Arc<dyn Broker> = client.clone();

    // ── 4. Calendar, notifier, sink ──
    let pair = config.pair();
    let calendar = Arc::new(ExchangeCalendar::new(
        client,
        pair.tickers().iter().map(|t| t.to_string()).collect(),
        Duration::from_secs(config.calendar.refresh_secs),
    ));

    let notifier: Arc<dyn Notifier> = match &secrets.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(
            telegram.bot_token.clone(),
            telegram.chat_id.clone(),
        )?),
        None => Arc::new(LogNotifier),
    };

    let sink: Arc<dyn SnapshotSink> = if config.persistence.csv_enabled {
        Arc::new(CsvSnapshotSink::new(&config.persistence.data_dir)?)
    } else {
        Arc::new(NullSnapshotSink)
    };

    // ── 5. Trader + loop ──
    let trader = Trader::new(
        Arc::clone(&broker),
        Arc::clone(&notifier),
        pair,
        config.strategy_params(),
        config.execution_params(),
    );
    let polling = PollingLoop::new(broker, trader, calendar, sink, config.loop_settings());

    // ── 6. Ctrl-C → graceful stop after the current tick ──
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, stopping after the current tick");
        let _ = shutdown_tx.send(()).await;
    });

    notify_quietly(&notifier, "LevSwap started");

    match polling.run(shutdown_rx).await {
        Ok(state) => {
            info!(state = %state, "LevSwap stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "LevSwap terminated");
            // Last message out before the runtime shuts down
            let _ = notify_quietly(&notifier, format!("LevSwap terminated: {}", e)).await;
            Err(e)
        }
    }
}
