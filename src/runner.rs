//! Polling loop
//!
//! Drives the trader on a fixed schedule while the market is open. Each tick:
//! calendar check, position read, snapshot, `process`, state record. Shutdown
//! is only observed between ticks, so a swap in progress always finishes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::calendar::MarketCalendar;
use crate::persistence::{SnapshotSink, StateRecord};
use crate::trader::{Trader, TraderState};

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    /// Wait before re-checking a closed market
    pub closed_market_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            closed_market_backoff: Duration::from_secs(300),
        }
    }
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    MarketClosed,
    /// Transient failure or incomplete snapshot; state unchanged
    Skipped,
    Processed { changed: bool },
}

pub struct PollingLoop {
    broker: Arc<dyn Broker>,
    trader: Trader,
    calendar: Arc<dyn MarketCalendar>,
    sink: Arc<dyn SnapshotSink>,
    settings: LoopSettings,
    state: TraderState,
}

fn fatal_cause(err: &anyhow::Error) -> Option<&BrokerError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BrokerError>())
        .filter(|e| e.is_fatal())
}

impl PollingLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        trader: Trader,
        calendar: Arc<dyn MarketCalendar>,
        sink: Arc<dyn SnapshotSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            broker,
            trader,
            calendar,
            sink,
            settings,
            state: TraderState::Initializing,
        }
    }

    pub fn state(&self) -> TraderState {
        self.state
    }

    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`. Errors are fatal.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        match self.calendar.is_market_open(now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(now = %now, "Market closed");
                return Ok(TickOutcome::MarketClosed);
            }
            Err(e) => {
                if let Some(fatal) = fatal_cause(&e) {
                    return Err(fatal.clone().into());
                }
                warn!(error = %e, "Market calendar unavailable, skipping tick");
                return Ok(TickOutcome::Skipped);
            }
        }

        let positions = match self.broker.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Failed to fetch positions, skipping tick");
                return Ok(TickOutcome::Skipped);
            }
        };

        let pair = self.trader.pair();
        let (base, lev) = match pair.split(&positions) {
            (Some(base), Some(lev)) => (base.clone(), lev.clone()),
            (base, lev) => {
                warn!(
                    base_present = base.is_some(),
                    lev_present = lev.is_some(),
                    base = %pair.base,
                    leveraged = %pair.leveraged,
                    "Instrument missing from positions, skipping tick"
                );
                return Ok(TickOutcome::Skipped);
            }
        };

        if let Err(e) = self.sink.write_snapshot(&positions, now).await {
            warn!(error = %e, "Failed to write positions snapshot");
        }

        let previous = self.state;
        self.state = self.trader.process(previous, &base, &lev, now).await?;
        let changed = previous.name() != self.state.name();
        if changed {
            info!(from = %previous, to = %self.state, "State changed");
        }

        if let Err(e) = self.sink.write_state(&StateRecord::new(&self.state, now)).await {
            warn!(error = %e, "Failed to write state record");
        }

        Ok(TickOutcome::Processed { changed })
    }

    /// Tick until `shutdown` fires or a fatal error occurs
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> Result<TraderState> {
        info!(
            interval_secs = self.settings.poll_interval.as_secs_f64(),
            base = %self.trader.pair().base,
            leveraged = %self.trader.pair().leveraged,
            "Polling loop started"
        );

        let mut next_run = Instant::now();
        loop {
            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, state = %self.state, "Fatal error, stopping polling loop");
                    return Err(e);
                }
            };

            let now = Instant::now();
            if outcome == TickOutcome::MarketClosed {
                next_run = now + self.settings.closed_market_backoff;
            } else {
                next_run += self.settings.poll_interval;
                if next_run < now {
                    warn!(
                        behind_ms = (now - next_run).as_millis() as u64,
                        "Polling loop behind schedule"
                    );
                    next_run = now;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!(state = %self.state, "Shutting down polling loop");
                    break;
                }
                _ = sleep_until(next_run) => {}
            }
        }

        Ok(self.state)
    }
}
