//! Brokerage client
//!
//! - `Broker`: the operations the trading core consumes
//! - `Trading212Client`: REST implementation against the Trading 212 API
//! - `RateLimiter`: per-endpoint call spacing, acquired before every request
//! - Fill detection: a "not found" on an order this process knows about means
//!   the order is no longer open, never that it did not exist

pub mod rate_limit;
pub mod rest;
pub mod types;

pub use rate_limit::{Category, RateLimiter};
pub use rest::Trading212Client;
pub use types::*;

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::types::{Cash, CancelOutcome, Order, OrderId, OrderLookup, Position, Side};

/// Failures surfaced by broker operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// The requested resource does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker rejected the request (insufficient funds, bad quantity, ...)
    #[error("rejected by broker: {0}")]
    Validation(String),

    /// Transport failure or unexpected server error
    #[error("network error: {0}")]
    Network(String),

    /// Broker-side throttling (HTTP 429)
    #[error("rate limited by broker: {0}")]
    RateLimited(String),

    /// Credentials rejected; unrecoverable without operator action
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Response body did not match the expected schema
    #[error("failed to decode broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Map a non-success HTTP status to the error taxonomy
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {} {}", status, truncate(body, 300));
        match status {
            404 => BrokerError::NotFound(detail),
            400 | 422 => BrokerError::Validation(detail),
            401 | 403 => BrokerError::Auth(detail),
            429 => BrokerError::RateLimited(detail),
            _ => BrokerError::Network(detail),
        }
    }

    /// Errors that must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Auth(_))
    }

    /// Errors worth retrying on a later tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_) | BrokerError::RateLimited(_) | BrokerError::Decode(_)
        )
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BrokerError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            BrokerError::from_status(status.as_u16(), &err.to_string())
        } else {
            BrokerError::Network(err.to_string())
        }
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

/// Operations the trading core needs from a brokerage.
///
/// Implementations acquire the matching rate-limit category before every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// All open positions
    async fn fetch_positions(&self) -> BrokerResult<Vec<Position>>;

    /// A single position; `NotFound` when the account holds none of `ticker`
    async fn fetch_position(&self, ticker: &str) -> BrokerResult<Position>;

    async fn fetch_cash(&self) -> BrokerResult<Cash>;

    async fn list_open_orders(&self) -> BrokerResult<Vec<Order>>;

    /// Distinguishes "still open", "no longer open" and "never existed"
    async fn fetch_order(&self, id: OrderId) -> BrokerResult<OrderLookup>;

    async fn cancel_order(&self, id: OrderId) -> BrokerResult<CancelOutcome>;

    /// Place a market order for a positive `quantity`
    async fn place_market_order(&self, ticker: &str, side: Side, quantity: f64)
        -> BrokerResult<Order>;
}

/// Most recent order ids kept by [`KnownOrders`]
pub const KNOWN_ORDERS_CAPACITY: usize = 1024;

/// Ids of orders this process placed or saw listed as open.
///
/// The broker answers 404 both for orders that were filled and for ids that
/// never existed; membership here is what tells the two apart. Only the most
/// recent `capacity` ids are kept, oldest evicted first.
#[derive(Debug)]
pub struct KnownOrders {
    capacity: usize,
    inner: Mutex<KnownIds>,
}

#[derive(Debug, Default)]
struct KnownIds {
    ids: HashSet<OrderId>,
    order: VecDeque<OrderId>,
}

impl Default for KnownOrders {
    fn default() -> Self {
        Self::with_capacity(KNOWN_ORDERS_CAPACITY)
    }
}

impl KnownOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(KnownIds::default()),
        }
    }

    pub fn remember(&self, id: OrderId) {
        let mut known = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !known.ids.insert(id) {
            return;
        }
        known.order.push_back(id);
        while known.order.len() > self.capacity {
            if let Some(oldest) = known.order.pop_front() {
                known.ids.remove(&oldest);
            }
        }
    }

    pub fn is_known(&self, id: OrderId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ids
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ids
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interpret a 404 on an order lookup
    pub fn lookup_missing(&self, id: OrderId) -> OrderLookup {
        if self.is_known(id) {
            OrderLookup::Filled
        } else {
            OrderLookup::NotFound
        }
    }

    /// Interpret a 404 on an order cancellation
    pub fn cancel_missing(&self, id: OrderId) -> CancelOutcome {
        if self.is_known(id) {
            CancelOutcome::AlreadyClosed
        } else {
            CancelOutcome::NotFound
        }
    }
}

/// Round a quantity toward zero to the broker's precision
pub fn truncate_quantity(quantity: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    // Absorb representation error (19.99 * 100 = 1998.9999...)
    let scaled = quantity * scale;
    (scaled + scaled.signum() * 1e-6).trunc() / scale
}
