//! Trading 212 wire types
//!
//! Request/response bodies of the v0 REST API and their conversion into the
//! crate's domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Cash, Order, OrderKind, OrderStatus, Position, Side};

/// `GET /equity/portfolio` and `GET /equity/portfolio/{ticker}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioPosition {
    pub ticker: String,
    pub quantity: f64,
    #[serde(default)]
    pub average_price: f64,
    pub current_price: f64,
    #[serde(default)]
    pub ppl: Option<f64>,
    #[serde(default)]
    pub initial_fill_date: Option<DateTime<Utc>>,
}

impl From<PortfolioPosition> for Position {
    fn from(raw: PortfolioPosition) -> Self {
        Position::new(raw.ticker, raw.quantity, raw.average_price, raw.current_price)
    }
}

/// `GET /equity/account/cash`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCash {
    pub free: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub invested: f64,
    #[serde(default)]
    pub blocked: Option<f64>,
    #[serde(default)]
    pub ppl: Option<f64>,
}

impl From<AccountCash> for Cash {
    fn from(raw: AccountCash) -> Self {
        Cash {
            free: raw.free,
            total: raw.total,
            invested: raw.invested,
            blocked: raw.blocked.unwrap_or(0.0),
        }
    }
}

/// Order as returned by the orders endpoints. Sells carry negative quantities.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityOrder {
    pub id: i64,
    pub ticker: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub filled_quantity: Option<f64>,
    #[serde(rename = "type")]
    pub kind: OrderKind,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}

impl From<EquityOrder> for Order {
    fn from(raw: EquityOrder) -> Self {
        let side = if raw.quantity < 0.0 { Side::Sell } else { Side::Buy };
        Order {
            id: raw.id,
            ticker: raw.ticker,
            side,
            quantity: raw.quantity.abs(),
            filled_quantity: raw.filled_quantity.unwrap_or(0.0).abs(),
            kind: raw.kind,
            status: raw.status,
            limit_price: raw.limit_price,
            stop_price: raw.stop_price,
            created_at: raw.creation_time,
        }
    }
}

/// Order validity for pending orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeValidity {
    Day,
    GoodTillCancel,
}

/// `POST /equity/orders/market`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOrderRequest {
    pub ticker: String,
    /// Negative to sell
    pub quantity: f64,
    pub extended_hours: bool,
}

/// `POST /equity/orders/limit`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOrderRequest {
    pub ticker: String,
    pub quantity: f64,
    pub limit_price: f64,
    pub time_validity: TimeValidity,
}

/// `POST /equity/orders/stop`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOrderRequest {
    pub ticker: String,
    pub quantity: f64,
    pub stop_price: f64,
    pub time_validity: TimeValidity,
}

/// Signed wire quantity for a side
pub fn signed_quantity(side: Side, quantity: f64) -> f64 {
    match side {
        Side::Buy => quantity.abs(),
        Side::Sell => -quantity.abs(),
    }
}

/// `GET /equity/metadata/instruments` (only the fields the calendar needs)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradableInstrument {
    pub ticker: String,
    #[serde(default)]
    pub name: Option<String>,
    pub working_schedule_id: i64,
}

/// `GET /equity/metadata/exchanges`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_schedules: Vec<WorkingSchedule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingSchedule {
    pub id: i64,
    #[serde(default)]
    pub time_events: Vec<TimeEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeEvent {
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TimeEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeEventKind {
    Open,
    Close,
    BreakStart,
    BreakEnd,
    PreMarketOpen,
    AfterHoursOpen,
    AfterHoursClose,
    OvernightOpen,
    #[serde(other)]
    Other,
}
