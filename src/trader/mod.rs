//! Trader state machine
//!
//! Holds exactly one of the two instruments and rotates between them:
//! - `Initializing`: derive the holding from the account (buy leverage with idle cash)
//! - `HoldingLeveraged`: wait for the leveraged price to run ahead of a still base
//! - `HoldingNonLeveraged`: return to leverage on profit, recovery or stop-loss
//!
//! The state is a plain value. `process` consumes one and returns the next, so a
//! failure anywhere in a tick, a failed swap included, leaves the previous
//! state intact.

pub mod decision;
pub mod swap;

pub use decision::{decide, Decision, StrategyParams, SwapReason};
pub use swap::{ExecutionParams, SwapError, SwapFailure, SwapFill};

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError, BrokerResult};
use crate::notifier::{notify_quietly, Notifier};
use crate::signal::SignalReference;
use crate::types::{Instrument, InstrumentPair, Position};

/// Logical position of the bot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraderState {
    Initializing,
    HoldingLeveraged(SignalReference),
    HoldingNonLeveraged(SignalReference),
}

impl TraderState {
    pub fn name(&self) -> &'static str {
        match self {
            TraderState::Initializing => "Initializing",
            TraderState::HoldingLeveraged(_) => "HoldingLeveraged",
            TraderState::HoldingNonLeveraged(_) => "HoldingNonLeveraged",
        }
    }

    pub fn reference(&self) -> Option<&SignalReference> {
        match self {
            TraderState::Initializing => None,
            TraderState::HoldingLeveraged(r) | TraderState::HoldingNonLeveraged(r) => Some(r),
        }
    }

    /// Instrument currently held, if known
    pub fn holding(&self) -> Option<Instrument> {
        match self {
            TraderState::Initializing => None,
            TraderState::HoldingLeveraged(_) => Some(Instrument::Leveraged),
            TraderState::HoldingNonLeveraged(_) => Some(Instrument::Base),
        }
    }

    /// Holding state for `instrument` with `reference`
    pub fn holding_with(instrument: Instrument, reference: SignalReference) -> Self {
        match instrument {
            Instrument::Base => TraderState::HoldingNonLeveraged(reference),
            Instrument::Leveraged => TraderState::HoldingLeveraged(reference),
        }
    }
}

impl Default for TraderState {
    fn default() -> Self {
        TraderState::Initializing
    }
}

impl fmt::Display for TraderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-fatal failures end the tick; fatal ones propagate
fn absorb<T>(result: BrokerResult<T>, what: &str) -> Result<Option<T>, BrokerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(error = %e, "{}", what);
            Ok(None)
        }
    }
}

pub struct Trader {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    pair: InstrumentPair,
    strategy: StrategyParams,
    execution: ExecutionParams,
}

impl Trader {
    pub fn new(
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        pair: InstrumentPair,
        strategy: StrategyParams,
        execution: ExecutionParams,
    ) -> Self {
        Self {
            broker,
            notifier,
            pair,
            strategy,
            execution,
        }
    }

    pub fn pair(&self) -> &InstrumentPair {
        &self.pair
    }

    /// Advance the state machine by one tick.
    ///
    /// Only fatal broker errors are returned; every other failure ends the tick
    /// in `state`.
    pub async fn process(
        &self,
        state: TraderState,
        base: &Position,
        lev: &Position,
        now: DateTime<Utc>,
    ) -> Result<TraderState, BrokerError> {
        let decision = decide(&state, base.current_price, lev.current_price, now, &self.strategy);

        match decision {
            Decision::Initialize => self.initialize(base, lev, now).await,
            Decision::Stay => Ok(state),
            Decision::ResetReference(reference) => {
                info!(
                    base = reference.base_value_at_last_change,
                    lev = reference.lev_value_at_last_change,
                    "Base price changed, reference reset"
                );
                Ok(match state {
                    TraderState::HoldingLeveraged(_) => TraderState::HoldingLeveraged(reference),
                    TraderState::HoldingNonLeveraged(_) => TraderState::HoldingNonLeveraged(reference),
                    TraderState::Initializing => state,
                })
            }
            Decision::Swap { from, reason } => self.execute_swap(state, from, reason, base, lev, now).await,
        }
    }

    async fn execute_swap(
        &self,
        state: TraderState,
        from: Instrument,
        reason: SwapReason,
        base: &Position,
        lev: &Position,
        now: DateTime<Utc>,
    ) -> Result<TraderState, BrokerError> {
        let to = from.other();
        let divergence = state
            .reference()
            .map(|r| r.divergence(lev.current_price))
            .unwrap_or(0.0);

        info!(
            reason = %reason,
            from = %from,
            to = %to,
            base = base.current_price,
            lev = lev.current_price,
            divergence,
            "Swap triggered"
        );
        notify_quietly(
            &self.notifier,
            format!(
                "{}: swapping {} to {} (base {:.4}, lev {:.4}, divergence {:.3}%)",
                reason,
                from,
                to,
                base.current_price,
                lev.current_price,
                divergence * 100.0
            ),
        );

        match self.swap(from, base, lev).await {
            Ok(fill) => {
                let reference = SignalReference::new(fill.base_price, fill.lev_price, fill.entry_price, now);
                let next = TraderState::holding_with(to, reference);
                info!(state = %next, entry = fill.entry_price, "Swap completed");
                notify_quietly(
                    &self.notifier,
                    format!("Swap completed: now holding {} at {:.4}", to, fill.entry_price),
                );
                Ok(next)
            }
            Err(failure) => {
                if let Some(fatal) = failure.error.fatal() {
                    return Err(fatal.clone());
                }
                warn!(
                    error = %failure.error,
                    sold = failure.sold,
                    state = %state,
                    "Swap failed"
                );
                notify_quietly(
                    &self.notifier,
                    format!("Swap {} to {} failed: {} (staying in {})", from, to, failure.error, state),
                );
                Ok(state)
            }
        }
    }

    /// Derive the holding from the account, buying leverage with idle cash
    async fn initialize(
        &self,
        base: &Position,
        lev: &Position,
        now: DateTime<Utc>,
    ) -> Result<TraderState, BrokerError> {
        let Some(open_orders) = absorb(self.broker.list_open_orders().await, "Failed to list open orders")? else {
            return Ok(TraderState::Initializing);
        };
        for order in &open_orders {
            info!(id = order.id, ticker = %order.ticker, "Cancelling stale order");
            absorb(self.broker.cancel_order(order.id).await, "Failed to cancel stale order")?;
        }

        tokio::time::sleep(self.execution.post_cancel_delay).await;

        let Some(positions) = absorb(self.broker.fetch_positions().await, "Failed to fetch positions")? else {
            return Ok(TraderState::Initializing);
        };
        let Some(cash) = absorb(self.broker.fetch_cash().await, "Failed to fetch cash")? else {
            return Ok(TraderState::Initializing);
        };

        let (held_base, held_lev) = self.pair.split(&positions);
        let held_base = held_base
            .cloned()
            .unwrap_or_else(|| Position::empty(&self.pair.base, base.current_price));
        let held_lev = held_lev
            .cloned()
            .unwrap_or_else(|| Position::empty(&self.pair.leveraged, lev.current_price));

        let base_value = held_base.current_value();
        let lev_value = held_lev.current_value();
        let free = cash.free;
        info!(base_value, lev_value, cash = free, "Initializing from account");

        if base_value > lev_value && base_value > free {
            let reference = SignalReference::new(
                held_base.current_price,
                held_lev.current_price,
                held_base.current_price,
                now,
            );
            return Ok(self.initialized(TraderState::HoldingNonLeveraged(reference)));
        }

        if lev_value > base_value && lev_value > free {
            let reference = SignalReference::new(
                held_base.current_price,
                held_lev.current_price,
                held_lev.current_price,
                now,
            );
            return Ok(self.initialized(TraderState::HoldingLeveraged(reference)));
        }

        if free <= self.execution.min_cash {
            info!(cash = free, "Nothing held and no cash to invest");
            return Ok(TraderState::Initializing);
        }

        match self.buy_with_free_cash(&held_lev).await {
            Ok(bought) => {
                let reference = SignalReference::new(
                    held_base.current_price,
                    bought.current_price,
                    bought.current_price,
                    now,
                );
                Ok(self.initialized(TraderState::HoldingLeveraged(reference)))
            }
            Err(e) => {
                if let Some(fatal) = e.fatal() {
                    return Err(fatal.clone());
                }
                warn!(error = %e, "Initial leveraged buy failed");
                notify_quietly(
                    &self.notifier,
                    format!("Initial leveraged buy failed: {}", e),
                );
                Ok(TraderState::Initializing)
            }
        }
    }

    fn initialized(&self, state: TraderState) -> TraderState {
        let entry = state.reference().map(|r| r.position_entry_price).unwrap_or(0.0);
        info!(state = %state, entry, "Initialized");
        notify_quietly(
            &self.notifier,
            format!("Initialized: {} (entry {:.4})", state, entry),
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::notifier::MockNotifier;
    use crate::types::{Cash, Order, OrderKind, OrderStatus, Side};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap()
    }

    fn quiet_notifier() -> Arc<MockNotifier> {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));
        Arc::new(notifier)
    }

    fn trader(broker: MockBroker) -> Trader {
        Trader::new(
            Arc::new(broker),
            quiet_notifier(),
            InstrumentPair::default(),
            StrategyParams::default(),
            ExecutionParams::default(),
        )
    }

    fn base() -> Position {
        Position::new("VUAAm_EQ", 10.0, 95.0, 100.0)
    }

    fn lev() -> Position {
        Position::new("US5Ld_EQ", 0.01, 40.0, 50.0)
    }

    #[test]
    fn state_accessors() {
        let reference = SignalReference::new(1.0, 2.0, 3.0, now());
        let state = TraderState::holding_with(Instrument::Base, reference);
        assert_eq!(state, TraderState::HoldingNonLeveraged(reference));
        assert_eq!(state.holding(), Some(Instrument::Base));
        assert_eq!(state.reference(), Some(&reference));
        assert_eq!(TraderState::default().reference(), None);
        assert_eq!(TraderState::Initializing.to_string(), "Initializing");
    }

    #[tokio::test]
    async fn holding_state_without_trigger_makes_no_broker_calls() {
        let reference = SignalReference::new(100.0, 50.0, 100.0, now());
        let state = TraderState::HoldingLeveraged(reference);

        let next = trader(MockBroker::new())
            .process(state, &base(), &lev(), now())
            .await
            .unwrap();
        assert_eq!(next, state);
    }

    #[tokio::test(start_paused = true)]
    async fn initializing_cancels_stale_orders_before_reading_account() {
        let mut broker = MockBroker::new();
        broker.expect_list_open_orders().times(1).returning(|| {
            Ok(vec![Order {
                id: 77,
                ticker: "US5Ld_EQ".into(),
                side: Side::Buy,
                quantity: 1.0,
                filled_quantity: 0.0,
                kind: OrderKind::Limit,
                status: OrderStatus::New,
                limit_price: Some(45.0),
                stop_price: None,
                created_at: None,
            }])
        });
        broker
            .expect_cancel_order()
            .withf(|id| *id == 77)
            .times(1)
            .returning(|_| Ok(crate::types::CancelOutcome::Cancelled));
        broker
            .expect_fetch_positions()
            .times(1)
            .returning(|| Ok(vec![Position::new("VUAAm_EQ", 10.0, 95.0, 100.0)]));
        broker.expect_fetch_cash().times(1).returning(|| {
            Ok(Cash {
                free: 3.0,
                ..Cash::default()
            })
        });

        let next = trader(broker)
            .process(TraderState::Initializing, &base(), &lev(), now())
            .await
            .unwrap();

        match next {
            TraderState::HoldingNonLeveraged(reference) => {
                assert_eq!(reference.position_entry_price, 100.0);
                assert_eq!(reference.lev_value_at_last_change, 50.0);
                assert_eq!(reference.time_last_base_change, now());
            }
            other => panic!("expected HoldingNonLeveraged, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_notifier_does_not_hold_up_the_tick() {
        struct Hanging;

        #[async_trait::async_trait]
        impl Notifier for Hanging {
            async fn notify(&self, _message: &str) -> anyhow::Result<()> {
                std::future::pending().await
            }
        }

        let mut broker = MockBroker::new();
        broker.expect_list_open_orders().returning(|| Ok(vec![]));
        broker
            .expect_fetch_positions()
            .returning(|| Ok(vec![Position::new("VUAAm_EQ", 10.0, 95.0, 100.0)]));
        broker.expect_fetch_cash().returning(|| Ok(Cash::default()));

        let trader = Trader::new(
            Arc::new(broker),
            Arc::new(Hanging),
            InstrumentPair::default(),
            StrategyParams::default(),
            ExecutionParams::default(),
        );

        // Only the 10s post-cancel wait should elapse
        let next = tokio::time::timeout(
            std::time::Duration::from_secs(11),
            trader.process(TraderState::Initializing, &base(), &lev(), now()),
        )
        .await
        .expect("process blocked on the notifier")
        .unwrap();
        assert!(matches!(next, TraderState::HoldingNonLeveraged(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn initializing_with_nothing_stays_initializing() {
        let mut broker = MockBroker::new();
        broker.expect_list_open_orders().returning(|| Ok(vec![]));
        broker.expect_fetch_positions().returning(|| Ok(vec![]));
        broker.expect_fetch_cash().returning(|| Ok(Cash::default()));
        broker.expect_place_market_order().never();

        let next = trader(broker)
            .process(TraderState::Initializing, &base(), &lev(), now())
            .await
            .unwrap();
        assert_eq!(next, TraderState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_order_fails_the_swap_without_cancelling() {
        let mut broker = MockBroker::new();
        broker
            .expect_fetch_position()
            .returning(|ticker| Ok(Position::new(ticker, 20.0, 98.0, 100.5)));
        broker.expect_place_market_order().times(1).returning(|ticker, side, quantity| {
            Ok(Order {
                id: 9,
                ticker: ticker.to_string(),
                side,
                quantity,
                filled_quantity: 0.0,
                kind: OrderKind::Market,
                status: OrderStatus::New,
                limit_price: None,
                stop_price: None,
                created_at: None,
            })
        });
        broker
            .expect_fetch_order()
            .returning(|_| Ok(crate::types::OrderLookup::Closed(OrderStatus::Rejected)));
        broker.expect_cancel_order().never();

        let state = TraderState::HoldingLeveraged(SignalReference::new(100.0, 100.0, 98.0, now()));
        let next = trader(broker)
            .process(
                state,
                &Position::new("VUAAm_EQ", 0.1, 99.0, 100.0),
                &Position::new("US5Ld_EQ", 20.0, 98.0, 100.5),
                now() + chrono::Duration::minutes(3),
            )
            .await
            .unwrap();
        assert_eq!(next, state);
    }

    #[tokio::test]
    async fn transient_failure_while_initializing_is_absorbed() {
        let mut broker = MockBroker::new();
        broker
            .expect_list_open_orders()
            .returning(|| Err(BrokerError::Network("timeout".into())));

        let next = trader(broker)
            .process(TraderState::Initializing, &base(), &lev(), now())
            .await
            .unwrap();
        assert_eq!(next, TraderState::Initializing);
    }

    #[tokio::test]
    async fn auth_failure_while_initializing_propagates() {
        let mut broker = MockBroker::new();
        broker
            .expect_list_open_orders()
            .returning(|| Err(BrokerError::Auth("HTTP 401".into())));

        let err = trader(broker)
            .process(TraderState::Initializing, &base(), &lev(), now())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
