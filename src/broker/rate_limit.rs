//! Per-endpoint rate limiting
//!
//! Trading 212 publishes a minimum spacing between calls for each endpoint
//! family. `RateLimiter::wait` suspends the caller until that spacing has
//! elapsed for the given category. Each category has its own lock, so a wait on
//! one never delays another, and concurrent waiters on the same category are
//! serialized.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Endpoint families with independent rate-limit budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Positions,
    PositionSingle,
    Cash,
    OrdersList,
    OrderSingle,
    OrderPlaceLimit,
    OrderPlaceMarket,
    OrderPlaceStop,
    OrderCancel,
    Instruments,
    Exchanges,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Positions,
        Category::PositionSingle,
        Category::Cash,
        Category::OrdersList,
        Category::OrderSingle,
        Category::OrderPlaceLimit,
        Category::OrderPlaceMarket,
        Category::OrderPlaceStop,
        Category::OrderCancel,
        Category::Instruments,
        Category::Exchanges,
    ];

    /// Published minimum spacing between calls
    pub fn min_interval(&self) -> Duration {
        match self {
            Category::Positions => Duration::from_secs(5),
            Category::PositionSingle => Duration::from_secs(1),
            Category::Cash => Duration::from_secs(2),
            Category::OrdersList => Duration::from_secs(5),
            Category::OrderSingle => Duration::from_secs(1),
            Category::OrderPlaceLimit => Duration::from_secs(2),
            // 50 per minute
            Category::OrderPlaceMarket => Duration::from_millis(1200),
            Category::OrderPlaceStop => Duration::from_secs(2),
            Category::OrderCancel => Duration::from_millis(1200),
            Category::Instruments => Duration::from_secs(50),
            Category::Exchanges => Duration::from_secs(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Positions => "positions",
            Category::PositionSingle => "position_single",
            Category::Cash => "cash",
            Category::OrdersList => "orders_list",
            Category::OrderSingle => "order_single",
            Category::OrderPlaceLimit => "order_place_limit",
            Category::OrderPlaceMarket => "order_place_market",
            Category::OrderPlaceStop => "order_place_stop",
            Category::OrderCancel => "order_cancel",
            Category::Instruments => "instruments",
            Category::Exchanges => "exchanges",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Budget {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

/// Process-wide rate-limit budgets, shared through `Arc`
pub struct RateLimiter {
    budgets: HashMap<Category, Budget>,
}

impl RateLimiter {
    /// Limiter using the published interval table
    pub fn new() -> Self {
        Self::with_intervals(|category| category.min_interval())
    }

    /// Limiter with custom intervals (e.g. zero for tests)
    pub fn with_intervals(interval_for: impl Fn(Category) -> Duration) -> Self {
        let budgets = Category::ALL
            .iter()
            .map(|&category| {
                (
                    category,
                    Budget {
                        min_interval: interval_for(category),
                        last_call: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self { budgets }
    }

    /// Limiter that never waits
    pub fn unlimited() -> Self {
        Self::with_intervals(|_| Duration::ZERO)
    }

    pub fn min_interval(&self, category: Category) -> Duration {
        self.budgets
            .get(&category)
            .map(|b| b.min_interval)
            .unwrap_or_else(|| category.min_interval())
    }

    /// Wait until a call in `category` is allowed, then record it.
    pub async fn wait(&self, category: Category) {
        let Some(budget) = self.budgets.get(&category) else {
            return;
        };

        // Held across the sleep so same-category callers queue up
        let mut last_call = budget.last_call.lock().await;
        if let Some(last) = *last_call {
            let ready_at = last + budget.min_interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(
                    category = %category,
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "Rate limit: waiting"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
