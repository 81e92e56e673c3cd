//! Market calendar
//!
//! Decides whether the pair can be traded right now from the broker's own
//! exchange metadata: each instrument points at a working schedule, and each
//! schedule is a timeline of open/close events. An instrument is tradeable when
//! the latest event at or before `now` is an `OPEN`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{BrokerResult, Exchange, TimeEvent, TimeEventKind, TradableInstrument};

/// Gate consulted by the polling loop before any brokerage call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketCalendar: Send + Sync {
    async fn is_market_open(&self, now: DateTime<Utc>) -> Result<bool>;
}

/// Where instrument and exchange metadata come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn instruments(&self) -> BrokerResult<Vec<TradableInstrument>>;
    async fn exchanges(&self) -> BrokerResult<Vec<Exchange>>;
}

/// Time events per ticker, sorted by date
#[derive(Debug, Clone, Default)]
pub struct Schedules {
    by_ticker: HashMap<String, Vec<TimeEvent>>,
}

impl Schedules {
    /// Join instrument metadata with exchange schedules for `tickers`
    pub fn from_metadata(
        tickers: &[String],
        instruments: &[TradableInstrument],
        exchanges: &[Exchange],
    ) -> Self {
        let schedules: HashMap<i64, &Vec<TimeEvent>> = exchanges
            .iter()
            .flat_map(|exchange| exchange.working_schedules.iter())
            .map(|schedule| (schedule.id, &schedule.time_events))
            .collect();

        let mut by_ticker = HashMap::new();
        for ticker in tickers {
            let Some(instrument) = instruments.iter().find(|i| &i.ticker == ticker) else {
                warn!(ticker = %ticker, "Ticker not found in instrument metadata");
                continue;
            };
            let Some(events) = schedules.get(&instrument.working_schedule_id) else {
                warn!(
                    ticker = %ticker,
                    schedule_id = instrument.working_schedule_id,
                    "Working schedule not found in exchange metadata"
                );
                continue;
            };
            let mut events = (*events).clone();
            events.sort_by_key(|event| event.date);
            by_ticker.insert(ticker.clone(), events);
        }

        Self { by_ticker }
    }

    /// Open when the latest event at or before `now` is `OPEN`
    pub fn is_open_at(&self, ticker: &str, now: DateTime<Utc>) -> bool {
        let Some(events) = self.by_ticker.get(ticker) else {
            return false;
        };
        events
            .iter()
            .take_while(|event| event.date <= now)
            .last()
            .map(|event| event.kind == TimeEventKind::Open)
            .unwrap_or(false)
    }

    pub fn all_open_at(&self, tickers: &[String], now: DateTime<Utc>) -> bool {
        !tickers.is_empty() && tickers.iter().all(|ticker| self.is_open_at(ticker, now))
    }
}

struct Cached {
    schedules: Schedules,
    fetched_at: Instant,
}

/// Calendar backed by broker metadata, refreshed when stale
pub struct ExchangeCalendar {
    source: Arc<dyn MetadataSource>,
    tickers: Vec<String>,
    refresh_every: Duration,
    cache: Mutex<Option<Cached>>,
}

impl ExchangeCalendar {
    pub fn new(source: Arc<dyn MetadataSource>, tickers: Vec<String>, refresh_every: Duration) -> Self {
        Self {
            source,
            tickers,
            refresh_every,
            cache: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> BrokerResult<Schedules> {
        let instruments = self.source.instruments().await?;
        let exchanges = self.source.exchanges().await?;
        let schedules = Schedules::from_metadata(&self.tickers, &instruments, &exchanges);
        info!(
            tickers = self.tickers.len(),
            resolved = schedules.by_ticker.len(),
            "Market calendar refreshed"
        );
        Ok(schedules)
    }
}

#[async_trait]
impl MarketCalendar for ExchangeCalendar {
    async fn is_market_open(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut cache = self.cache.lock().await;

        let stale = cache
            .as_ref()
            .map(|c| c.fetched_at.elapsed() >= self.refresh_every)
            .unwrap_or(true);

        if stale {
            match self.fetch().await {
                Ok(schedules) => {
                    *cache = Some(Cached {
                        schedules,
                        fetched_at: Instant::now(),
                    });
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => match cache.as_ref() {
                    Some(_) => warn!(error = %e, "Calendar refresh failed, keeping previous metadata"),
                    None => return Err(anyhow!(e).context("Failed to load market calendar")),
                },
            }
        }

        let cached = cache
            .as_ref()
            .ok_or_else(|| anyhow!("Market calendar not loaded"))?;
        let open = cached.schedules.all_open_at(&self.tickers, now);
        debug!(open, now = %now, "Market calendar check");
        Ok(open)
    }
}
