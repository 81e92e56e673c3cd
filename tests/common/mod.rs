//! In-memory brokerage used by the integration tests.
//!
//! Market orders fill instantly at the current price unless orders are set to
//! stay open. Failures can be scripted per operation.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use levswap::broker::{truncate_quantity, Broker, BrokerError, BrokerResult};
use levswap::types::{
    CancelOutcome, Cash, Order, OrderId, OrderKind, OrderLookup, OrderStatus, Position, Side,
};

pub const BASE: &str = "VUAAm_EQ";
pub const LEV: &str = "US5Ld_EQ";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchPositions,
    FetchPosition,
    FetchCash,
    ListOpenOrders,
    FetchOrder,
    CancelOrder,
    PlaceMarketOrder,
}

#[derive(Default)]
struct State {
    quantities: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    cash: f64,
    next_id: OrderId,
    open_orders: HashMap<OrderId, Order>,
    known: HashSet<OrderId>,
    failures: HashMap<Op, VecDeque<BrokerError>>,
    order_failures: VecDeque<(String, Side, BrokerError)>,
    hold_orders: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct SimBroker {
    state: Mutex<State>,
}

impl SimBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().next_id = 1000;
        broker
    }

    pub fn with_price(self, ticker: &str, price: f64) -> Self {
        self.state.lock().unwrap().prices.insert(ticker.to_string(), price);
        self
    }

    pub fn with_holding(self, ticker: &str, quantity: f64, price: f64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.quantities.insert(ticker.to_string(), quantity);
            state.prices.insert(ticker.to_string(), price);
        }
        self
    }

    pub fn with_cash(self, cash: f64) -> Self {
        self.state.lock().unwrap().cash = cash;
        self
    }

    /// Placed orders stay open instead of filling
    pub fn hold_orders(&self) {
        self.state.lock().unwrap().hold_orders = true;
    }

    /// A pre-existing open order the account had before start
    pub fn with_open_order(self, ticker: &str, side: Side, quantity: f64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.open_orders.insert(id, order(id, ticker, side, quantity, OrderKind::Limit));
        }
        self
    }

    pub fn fail_next(&self, op: Op, err: BrokerError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn fail_order(&self, ticker: &str, side: Side, err: BrokerError) {
        self.state
            .lock()
            .unwrap()
            .order_failures
            .push_back((ticker.to_string(), side, err));
    }

    pub fn set_price(&self, ticker: &str, price: f64) {
        self.state.lock().unwrap().prices.insert(ticker.to_string(), price);
    }

    pub fn quantity(&self, ticker: &str) -> f64 {
        *self.state.lock().unwrap().quantities.get(ticker).unwrap_or(&0.0)
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().unwrap().cash
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().unwrap().open_orders.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn orders_placed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("place_market_order"))
            .collect()
    }

    fn begin(&self, op: Op, call: String) -> BrokerResult<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(err) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state)
    }
}

fn order(id: OrderId, ticker: &str, side: Side, quantity: f64, kind: OrderKind) -> Order {
    Order {
        id,
        ticker: ticker.to_string(),
        side,
        quantity,
        filled_quantity: 0.0,
        kind,
        status: OrderStatus::New,
        limit_price: None,
        stop_price: None,
        created_at: None,
    }
}

fn position(state: &State, ticker: &str) -> Option<Position> {
    let quantity = *state.quantities.get(ticker)?;
    if quantity <= 0.0 {
        return None;
    }
    let price = *state.prices.get(ticker).unwrap_or(&0.0);
    Some(Position::new(ticker, quantity, price, price))
}

#[async_trait]
impl Broker for SimBroker {
    async fn fetch_positions(&self) -> BrokerResult<Vec<Position>> {
        let state = self.begin(Op::FetchPositions, "fetch_positions".into())?;
        let mut tickers: Vec<&String> = state.quantities.keys().collect();
        tickers.sort();
        Ok(tickers
            .into_iter()
            .filter_map(|ticker| position(&state, ticker))
            .collect())
    }

    async fn fetch_position(&self, ticker: &str) -> BrokerResult<Position> {
        let state = self.begin(Op::FetchPosition, format!("fetch_position:{}", ticker))?;
        position(&state, ticker).ok_or_else(|| BrokerError::NotFound(ticker.to_string()))
    }

    async fn fetch_cash(&self) -> BrokerResult<Cash> {
        let state = self.begin(Op::FetchCash, "fetch_cash".into())?;
        Ok(Cash {
            free: state.cash,
            total: state.cash,
            ..Cash::default()
        })
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<Order>> {
        let mut state = self.begin(Op::ListOpenOrders, "list_open_orders".into())?;
        let orders: Vec<Order> = state.open_orders.values().cloned().collect();
        for o in &orders {
            state.known.insert(o.id);
        }
        Ok(orders)
    }

    async fn fetch_order(&self, id: OrderId) -> BrokerResult<OrderLookup> {
        let state = self.begin(Op::FetchOrder, format!("fetch_order:{}", id))?;
        Ok(match state.open_orders.get(&id) {
            Some(open) => OrderLookup::StillOpen(open.clone()),
            None if state.known.contains(&id) => OrderLookup::Filled,
            None => OrderLookup::NotFound,
        })
    }

    async fn cancel_order(&self, id: OrderId) -> BrokerResult<CancelOutcome> {
        let mut state = self.begin(Op::CancelOrder, format!("cancel_order:{}", id))?;
        Ok(if state.open_orders.remove(&id).is_some() {
            CancelOutcome::Cancelled
        } else if state.known.contains(&id) {
            CancelOutcome::AlreadyClosed
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn place_market_order(
        &self,
        ticker: &str,
        side: Side,
        quantity: f64,
    ) -> BrokerResult<Order> {
        let mut state = self.begin(
            Op::PlaceMarketOrder,
            format!("place_market_order:{}:{}:{}", ticker, side, quantity),
        )?;

        let scripted = state
            .order_failures
            .iter()
            .position(|(t, s, _)| t == ticker && *s == side);
        if let Some(index) = scripted {
            if let Some((_, _, err)) = state.order_failures.remove(index) {
                return Err(err);
            }
        }

        let quantity = truncate_quantity(quantity.abs(), 2);
        if quantity <= 0.0 {
            return Err(BrokerError::Validation("quantity rounds to zero".into()));
        }
        let price = *state
            .prices
            .get(ticker)
            .ok_or_else(|| BrokerError::Validation(format!("unknown ticker {}", ticker)))?;

        let id = state.next_id;
        state.next_id += 1;
        state.known.insert(id);
        let placed = order(id, ticker, side, quantity, OrderKind::Market);

        if state.hold_orders {
            state.open_orders.insert(id, placed.clone());
            return Ok(placed);
        }

        let held = *state.quantities.get(ticker).unwrap_or(&0.0);
        match side {
            Side::Buy => {
                let cost = quantity * price;
                if cost > state.cash + 1e-9 {
                    return Err(BrokerError::Validation("InsufficientFreeForStocksBuy".into()));
                }
                state.cash -= cost;
                state.quantities.insert(ticker.to_string(), held + quantity);
            }
            Side::Sell => {
                if quantity > held + 1e-9 {
                    return Err(BrokerError::Validation("SellingEquityNotOwned".into()));
                }
                state.cash += quantity * price;
                state.quantities.insert(ticker.to_string(), held - quantity);
            }
        }

        Ok(placed)
    }
}
