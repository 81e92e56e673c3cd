//! Order execution and fill verification
//!
//! A swap sells the held instrument down to its retained residual, confirms the
//! sell from the account, then spends the freed cash on the other instrument
//! and confirms that too. The broker forgets filled orders, so a fill is
//! confirmed by the order disappearing and the position value moving.

use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::Trader;
use crate::broker::{truncate_quantity, BrokerError};
use crate::types::{Instrument, OrderId, OrderLookup, OrderStatus, Position, Side};

/// Execution configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionParams {
    /// Wait between placing an order and checking it
    pub settlement_delay: Duration,
    /// Wait before reading the source position of a swap
    pub pre_swap_delay: Duration,
    /// Wait after cancelling stale orders on initialization
    pub post_cancel_delay: Duration,
    /// Minimum position value change that confirms a fill
    pub verification_tolerance: f64,
    /// Cash below this is not worth trading
    pub min_cash: f64,
    /// Fraction of free cash spent on a buy
    pub cash_buffer: f64,
    /// Units of the base instrument kept after selling it
    pub base_retained_qty: f64,
    /// Units of the leveraged instrument kept after selling it
    pub leveraged_retained_qty: f64,
}

impl ExecutionParams {
    /// Residual units kept so the broker keeps reporting the instrument's price
    pub fn retained(&self, instrument: Instrument) -> f64 {
        match instrument {
            Instrument::Base => self.base_retained_qty,
            Instrument::Leveraged => self.leveraged_retained_qty,
        }
    }
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            settlement_delay: Duration::from_secs(5),
            pre_swap_delay: Duration::from_secs(2),
            post_cancel_delay: Duration::from_secs(10),
            verification_tolerance: 5.0,
            min_cash: 10.0,
            cash_buffer: 0.9,
            base_retained_qty: 0.1,
            leveraged_retained_qty: 0.01,
        }
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("nothing to sell in {ticker} (quantity {quantity})")]
    NothingToSell { ticker: String, quantity: f64 },

    #[error("insufficient cash: {free:.2} free, {min:.2} required")]
    InsufficientCash { free: f64, min: f64 },

    #[error("order {0} still open after settlement delay")]
    OrderStillOpen(OrderId),

    #[error("order {id} closed without a fill ({status:?})")]
    OrderClosed { id: OrderId, status: OrderStatus },

    #[error("order {0} unknown to broker")]
    OrderUnknown(OrderId),

    #[error("{side} of {ticker} not reflected in position value ({before:.2} -> {after:.2})")]
    Unverified {
        ticker: String,
        side: Side,
        before: f64,
        after: f64,
    },
}

impl SwapError {
    /// The fatal broker error behind this failure, if any
    pub fn fatal(&self) -> Option<&BrokerError> {
        match self {
            SwapError::Broker(e) if e.is_fatal() => Some(e),
            _ => None,
        }
    }
}

/// A swap that did not complete
#[derive(Debug)]
pub struct SwapFailure {
    /// The sell leg was confirmed; the account now holds cash
    pub sold: bool,
    pub error: SwapError,
}

impl SwapFailure {
    fn before_sell(error: impl Into<SwapError>) -> Self {
        Self {
            sold: false,
            error: error.into(),
        }
    }

    fn after_sell(error: impl Into<SwapError>) -> Self {
        Self {
            sold: true,
            error: error.into(),
        }
    }
}

/// Prices observed after a confirmed swap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapFill {
    pub base_price: f64,
    pub lev_price: f64,
    /// Price of the instrument now held
    pub entry_price: f64,
}

impl Trader {
    /// Rotate out of `from` into the other instrument.
    ///
    /// `base` and `lev` are this tick's observations, used as price fallbacks
    /// when the broker no longer lists a position.
    pub(super) async fn swap(
        &self,
        from: Instrument,
        base: &Position,
        lev: &Position,
    ) -> Result<SwapFill, SwapFailure> {
        let to = from.other();
        let target_price = match to {
            Instrument::Base => base.current_price,
            Instrument::Leveraged => lev.current_price,
        };

        tokio::time::sleep(self.execution.pre_swap_delay).await;

        // Sell leg
        let source_ticker = self.pair.ticker(from);
        let source = match self.broker.fetch_position(source_ticker).await {
            Ok(position) => position,
            Err(BrokerError::NotFound(_)) => {
                return Err(SwapFailure::before_sell(SwapError::NothingToSell {
                    ticker: source_ticker.to_string(),
                    quantity: 0.0,
                }))
            }
            Err(e) => return Err(SwapFailure::before_sell(e)),
        };

        let sell_quantity = truncate_quantity(source.quantity - self.execution.retained(from), 2);
        if sell_quantity <= 0.0 {
            return Err(SwapFailure::before_sell(SwapError::NothingToSell {
                ticker: source_ticker.to_string(),
                quantity: source.quantity,
            }));
        }

        info!(ticker = %source_ticker, quantity = sell_quantity, "Selling");
        let source_after = self
            .market_order_confirmed(&source, Side::Sell, sell_quantity)
            .await
            .map_err(SwapFailure::before_sell)?;

        // Buy leg
        let target_before = self
            .position_or_empty(self.pair.ticker(to), target_price)
            .await
            .map_err(SwapFailure::after_sell)?;
        let target_after = self
            .buy_with_free_cash(&target_before)
            .await
            .map_err(SwapFailure::after_sell)?;

        let (base_after, lev_after) = match to {
            Instrument::Base => (&target_after, &source_after),
            Instrument::Leveraged => (&source_after, &target_after),
        };

        Ok(SwapFill {
            base_price: base_after.current_price,
            lev_price: lev_after.current_price,
            entry_price: target_after.current_price,
        })
    }

    /// Spend free cash (minus the buffer) on `target`; returns the confirmed position
    pub(super) async fn buy_with_free_cash(&self, target: &Position) -> Result<Position, SwapError> {
        let cash = self.broker.fetch_cash().await?;
        if cash.free < self.execution.min_cash {
            return Err(SwapError::InsufficientCash {
                free: cash.free,
                min: self.execution.min_cash,
            });
        }
        if target.current_price <= 0.0 {
            return Err(BrokerError::Validation(format!("no price for {}", target.ticker)).into());
        }

        let quantity = cash.free * self.execution.cash_buffer / target.current_price;
        info!(
            ticker = %target.ticker,
            quantity,
            cash = cash.free,
            price = target.current_price,
            "Buying"
        );
        self.market_order_confirmed(target, Side::Buy, quantity).await
    }

    /// Place a market order against `before` and confirm it from the account
    async fn market_order_confirmed(
        &self,
        before: &Position,
        side: Side,
        quantity: f64,
    ) -> Result<Position, SwapError> {
        let order = self
            .broker
            .place_market_order(&before.ticker, side, quantity)
            .await?;

        tokio::time::sleep(self.execution.settlement_delay).await;

        match self.broker.fetch_order(order.id).await? {
            OrderLookup::Filled => {}
            OrderLookup::StillOpen(open) => {
                warn!(id = open.id, status = ?open.status, "Order not filled, cancelling");
                if let Err(e) = self.broker.cancel_order(open.id).await {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!(id = open.id, error = %e, "Failed to cancel unfilled order");
                }
                return Err(SwapError::OrderStillOpen(open.id));
            }
            OrderLookup::Closed(status) => {
                return Err(SwapError::OrderClosed {
                    id: order.id,
                    status,
                })
            }
            OrderLookup::NotFound => return Err(SwapError::OrderUnknown(order.id)),
        }

        let after = self
            .position_or_empty(&before.ticker, before.current_price)
            .await?;
        let (value_before, value_after) = (before.current_value(), after.current_value());
        let tolerance = self.execution.verification_tolerance;
        let confirmed = match side {
            Side::Sell => value_after < value_before - tolerance,
            Side::Buy => value_after > value_before + tolerance,
        };

        if !confirmed {
            return Err(SwapError::Unverified {
                ticker: before.ticker.clone(),
                side,
                before: value_before,
                after: value_after,
            });
        }

        info!(
            ticker = %before.ticker,
            side = %side,
            value_before,
            value_after,
            "Fill confirmed"
        );
        Ok(after)
    }

    /// Current position, or an empty one priced at `price` when none is held
    pub(super) async fn position_or_empty(&self, ticker: &str, price: f64) -> Result<Position, BrokerError> {
        match self.broker.fetch_position(ticker).await {
            Ok(position) => Ok(position),
            Err(BrokerError::NotFound(_)) => Ok(Position::empty(ticker, price)),
            Err(e) => Err(e),
        }
    }
}
