//! Core types used throughout LevSwap
//!
//! Broker-facing snapshots (positions, orders, cash) and the instrument pair
//! the bot rotates between.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-assigned order identifier
pub type OrderId = i64;

/// Which of the two instruments a holding refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument {
    /// Non-leveraged (1x) instrument
    Base,
    /// Leveraged instrument, the default holding
    Leveraged,
}

impl Instrument {
    /// The instrument on the other side of a swap
    pub fn other(&self) -> Self {
        match self {
            Instrument::Base => Instrument::Leveraged,
            Instrument::Leveraged => Instrument::Base,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Base => write!(f, "non-leveraged"),
            Instrument::Leveraged => write!(f, "leveraged"),
        }
    }
}

/// The two substitutable tickers the bot swaps between
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentPair {
    pub base: String,
    pub leveraged: String,
}

impl InstrumentPair {
    pub fn new(base: impl Into<String>, leveraged: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            leveraged: leveraged.into(),
        }
    }

    pub fn ticker(&self, instrument: Instrument) -> &str {
        match instrument {
            Instrument::Base => &self.base,
            Instrument::Leveraged => &self.leveraged,
        }
    }

    pub fn tickers(&self) -> [&str; 2] {
        [&self.base, &self.leveraged]
    }

    /// Pick the base and leveraged positions out of a broker snapshot
    pub fn split<'a>(&self, positions: &'a [Position]) -> (Option<&'a Position>, Option<&'a Position>) {
        let base = positions.iter().find(|p| p.ticker == self.base);
        let leveraged = positions.iter().find(|p| p.ticker == self.leveraged);
        (base, leveraged)
    }
}

impl Default for InstrumentPair {
    fn default() -> Self {
        Self::new("VUAAm_EQ", "US5Ld_EQ")
    }
}

/// Position snapshot as reported by the broker. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: f64,
    pub average_price: f64,
    pub current_price: f64,
}

impl Position {
    pub fn new(ticker: impl Into<String>, quantity: f64, average_price: f64, current_price: f64) -> Self {
        Self {
            ticker: ticker.into(),
            quantity,
            average_price,
            current_price,
        }
    }

    /// A zero-quantity placeholder for an instrument the account does not hold
    pub fn empty(ticker: impl Into<String>, current_price: f64) -> Self {
        Self::new(ticker, 0.0, 0.0, current_price)
    }

    /// Market value of the holding
    pub fn current_value(&self) -> f64 {
        self.quantity * self.current_price
    }
}

/// Account cash balances
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cash {
    /// Available to trade
    pub free: f64,
    pub total: f64,
    pub invested: f64,
    pub blocked: f64,
}

/// Order side (buy/sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Confirmed,
    Working,
    PartiallyFilled,
    Filled,
    Cancelling,
    Cancelled,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::New
    }
}

/// Order as seen by the bot. Quantity is always positive; `side` carries direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub ticker: String,
    pub side: Side,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Check if order is complete
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Result of looking up an order this process placed or observed
#[derive(Debug, Clone, PartialEq)]
pub enum OrderLookup {
    /// The broker still lists the order as open
    StillOpen(Order),
    /// The order was known to us and is no longer open on the broker
    Filled,
    /// The broker reports the order cancelled or rejected without a fill
    Closed(OrderStatus),
    /// The broker has no such order and we never saw it
    NotFound,
}

impl OrderLookup {
    /// Classify an order the broker still returns
    pub fn from_listed(order: Order) -> Self {
        if !order.is_terminal() {
            return OrderLookup::StillOpen(order);
        }
        match order.status {
            OrderStatus::Filled => OrderLookup::Filled,
            status => OrderLookup::Closed(status),
        }
    }
}

/// Result of cancelling an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Known order that is no longer open (filled or already gone)
    AlreadyClosed,
    NotFound,
}
