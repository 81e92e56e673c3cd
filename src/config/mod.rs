//! Configuration management for LevSwap
//!
//! Loads from TOML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::runner::LoopSettings;
use crate::signal::SignalThresholds;
use crate::trader::{decision::min_hold_from_secs, ExecutionParams, StrategyParams};
use crate::types::InstrumentPair;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub broker: BrokerConfig,
    pub calendar: CalendarConfig,
    pub notifier: NotifierConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Non-leveraged (1x) ticker
    pub base_ticker: String,
    /// Leveraged ticker tracking the same index
    pub leveraged_ticker: String,
    /// Seconds between ticks while the market is open
    pub poll_interval_secs: u64,
    /// Seconds between calendar checks while the market is closed
    pub closed_market_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Relative leveraged move that counts as divergence
    pub divergence_threshold: f64,
    /// Seconds the base price must stand still before a divergence matures
    pub min_hold_secs: u64,
    /// Relative drop below entry that triggers the stop-loss
    pub stop_loss_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Wait after placing an order before verifying it
    pub settlement_delay_ms: u64,
    /// Wait before starting a swap
    pub pre_swap_delay_ms: u64,
    /// Wait after cancelling stale orders
    pub post_cancel_delay_ms: u64,
    /// Position value change that confirms a fill
    pub verification_tolerance: f64,
    /// Minimum free cash worth investing
    pub min_cash: f64,
    /// Fraction of free cash used per buy
    pub cash_buffer: f64,
    pub base_retained_qty: f64,
    pub leveraged_retained_qty: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// API root, demo or live
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    /// Seconds before exchange metadata is fetched again
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Send Telegram messages (otherwise notifications are only logged)
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for CSV files
    pub data_dir: String,
    /// Enable CSV snapshots
    pub csv_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines
    pub json: bool,
    /// Default filter when RUST_LOG is unset
    pub filter: String,
}

/// Secrets read from the environment only
#[derive(Clone)]
pub struct Secrets {
    pub trading212_key: String,
    pub telegram: Option<TelegramSecrets>,
}

#[derive(Clone)]
pub struct TelegramSecrets {
    pub bot_token: String,
    pub chat_id: String,
}

fn env_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("Required environment variable {} is not set", name),
    }
}

impl AppConfig {
    fn builder() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            .set_default("bot.base_ticker", "VUAAm_EQ")?
            .set_default("bot.leveraged_ticker", "US5Ld_EQ")?
            .set_default("bot.poll_interval_secs", 20)?
            .set_default("bot.closed_market_backoff_secs", 300)?
            // Strategy
            .set_default("strategy.divergence_threshold", 0.004)?
            .set_default("strategy.min_hold_secs", 120)?
            .set_default("strategy.stop_loss_pct", 0.005)?
            // Execution
            .set_default("execution.settlement_delay_ms", 5000)?
            .set_default("execution.pre_swap_delay_ms", 2000)?
            .set_default("execution.post_cancel_delay_ms", 10000)?
            .set_default("execution.verification_tolerance", 5.0)?
            .set_default("execution.min_cash", 10.0)?
            .set_default("execution.cash_buffer", 0.9)?
            .set_default("execution.base_retained_qty", 0.1)?
            .set_default("execution.leveraged_retained_qty", 0.01)?
            // Broker
            .set_default("broker.base_url", crate::broker::rest::DEMO_BASE_URL)?
            .set_default("broker.request_timeout_secs", 30)?
            .set_default("calendar.refresh_secs", 6 * 3600)?
            .set_default("notifier.enabled", false)?
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            .set_default("logging.json", false)?
            .set_default("logging.filter", "levswap=info")?;
        Ok(builder)
    }

    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (LEVSWAP__SECTION__KEY)
            .add_source(Environment::with_prefix("LEVSWAP").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self> {
        Self::builder()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Reject values the trader cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.bot.base_ticker == self.bot.leveraged_ticker {
            bail!("bot.base_ticker and bot.leveraged_ticker must differ");
        }
        if self.bot.poll_interval_secs == 0 {
            bail!("bot.poll_interval_secs must be positive");
        }
        if self.strategy.divergence_threshold <= 0.0 {
            bail!("strategy.divergence_threshold must be positive");
        }
        if self.strategy.stop_loss_pct <= 0.0 {
            bail!("strategy.stop_loss_pct must be positive");
        }
        if !(self.execution.cash_buffer > 0.0 && self.execution.cash_buffer <= 1.0) {
            bail!("execution.cash_buffer must be in (0, 1]");
        }
        if self.execution.base_retained_qty < 0.0 || self.execution.leveraged_retained_qty < 0.0 {
            bail!("retained quantities must not be negative");
        }
        Ok(())
    }

    /// Validate required environment variables
    pub fn validate_env(&self) -> Result<Secrets> {
        let trading212_key = env_var("TRADING212_KEY")?;

        let telegram = if self.notifier.enabled {
            Some(TelegramSecrets {
                bot_token: env_var("TELEGRAM_BOT_TOKEN")?,
                chat_id: env_var("TELEGRAM_CHAT_ID")?,
            })
        } else {
            None
        };

        Ok(Secrets {
            trading212_key,
            telegram,
        })
    }

    pub fn pair(&self) -> InstrumentPair {
        InstrumentPair::new(&self.bot.base_ticker, &self.bot.leveraged_ticker)
    }

    pub fn strategy_params(&self) -> StrategyParams {
        StrategyParams {
            thresholds: SignalThresholds {
                divergence_threshold: self.strategy.divergence_threshold,
                min_hold: min_hold_from_secs(self.strategy.min_hold_secs),
            },
            stop_loss_pct: self.strategy.stop_loss_pct,
        }
    }

    pub fn execution_params(&self) -> ExecutionParams {
        let e = &self.execution;
        ExecutionParams {
            settlement_delay: Duration::from_millis(e.settlement_delay_ms),
            pre_swap_delay: Duration::from_millis(e.pre_swap_delay_ms),
            post_cancel_delay: Duration::from_millis(e.post_cancel_delay_ms),
            verification_tolerance: e.verification_tolerance,
            min_cash: e.min_cash,
            cash_buffer: e.cash_buffer,
            base_retained_qty: e.base_retained_qty,
            leveraged_retained_qty: e.leveraged_retained_qty,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            poll_interval: Duration::from_secs(self.bot.poll_interval_secs),
            closed_market_backoff: Duration::from_secs(self.bot.closed_market_backoff_secs),
        }
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "pair={}/{} interval={}s threshold={} min_hold={}s stop_loss={} broker={} notifier={} csv={}",
            self.bot.base_ticker,
            self.bot.leveraged_ticker,
            self.bot.poll_interval_secs,
            self.strategy.divergence_threshold,
            self.strategy.min_hold_secs,
            self.strategy.stop_loss_pct,
            self.broker.base_url,
            self.notifier.enabled,
            self.persistence.csv_enabled
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
