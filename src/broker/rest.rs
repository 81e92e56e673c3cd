//! Trading 212 REST API Client
//!
//! Handles HTTP communication with the Trading 212 public API (v0).
//! Endpoints documented at: https://t212public-api-docs.redoc.ly/

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, RequestBuilder,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::rate_limit::{Category, RateLimiter};
use super::types::{
    signed_quantity, AccountCash, EquityOrder, Exchange, LimitOrderRequest, MarketOrderRequest,
    PortfolioPosition, StopOrderRequest, TimeValidity, TradableInstrument,
};
use super::{truncate, truncate_quantity, Broker, BrokerError, BrokerResult, KnownOrders};
use crate::calendar::MetadataSource;
use crate::types::{Cash, CancelOutcome, Order, OrderId, OrderLookup, Position, Side};

/// Live trading endpoint
pub const LIVE_BASE_URL: &str = "https://live.trading212.com/api/v0";
/// Practice account endpoint
pub const DEMO_BASE_URL: &str = "https://demo.trading212.com/api/v0";

/// Decimal places accepted for order quantities
const QUANTITY_DECIMALS: u32 = 2;

/// REST API client for Trading 212
pub struct Trading212Client {
    client: Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    known_orders: KnownOrders,
}

impl Trading212Client {
    /// Create a new REST client
    pub fn new(
        base_url: &str,
        api_key: &str,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(api_key).context("Invalid TRADING212_KEY header value")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
            known_orders: KnownOrders::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Acquire the category, send, and return the body of a successful response
    async fn send(&self, category: Category, request: RequestBuilder) -> BrokerResult<String> {
        self.limiter.wait(category).await;

        let request = request.build()?;
        debug!(
            category = %category,
            method = %request.method(),
            url = %request.url(),
            "API request"
        );

        let response = self.client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), body = %truncate(&body, 500), "API response");

        if status.is_success() {
            Ok(body)
        } else {
            Err(BrokerError::from_status(status.as_u16(), &body))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, category: Category, path: &str) -> BrokerResult<T> {
        let body = self.send(category, self.client.get(self.url(path))).await?;
        decode(&body)
    }

    fn remember(&self, order: &Order) {
        self.known_orders.remember(order.id);
    }

    /// Place a limit order (`limit_price` per share)
    pub async fn place_limit_order(
        &self,
        ticker: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
        time_validity: TimeValidity,
    ) -> BrokerResult<Order> {
        let quantity = order_quantity(quantity)?;
        let limit_price = order_price(limit_price, "limit")?;
        let payload = LimitOrderRequest {
            ticker: ticker.to_string(),
            quantity: signed_quantity(side, quantity),
            limit_price,
            time_validity,
        };

        let body = self
            .send(
                Category::OrderPlaceLimit,
                self.client.post(self.url("/equity/orders/limit")).json(&payload),
            )
            .await?;
        let order: Order = decode::<EquityOrder>(&body)?.into();
        self.remember(&order);
        info!(id = order.id, ticker, side = %side, quantity, limit_price, "Limit order created");
        Ok(order)
    }

    /// Place a stop order that becomes a market order at `stop_price`
    pub async fn place_stop_order(
        &self,
        ticker: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
        time_validity: TimeValidity,
    ) -> BrokerResult<Order> {
        let quantity = order_quantity(quantity)?;
        let stop_price = order_price(stop_price, "stop")?;
        let payload = StopOrderRequest {
            ticker: ticker.to_string(),
            quantity: signed_quantity(side, quantity),
            stop_price,
            time_validity,
        };

        let body = self
            .send(
                Category::OrderPlaceStop,
                self.client.post(self.url("/equity/orders/stop")).json(&payload),
            )
            .await?;
        let order: Order = decode::<EquityOrder>(&body)?.into();
        self.remember(&order);
        info!(id = order.id, ticker, side = %side, quantity, stop_price, "Stop order created");
        Ok(order)
    }

    /// Get instrument metadata (large payload)
    pub async fn fetch_instruments(&self) -> BrokerResult<Vec<TradableInstrument>> {
        let instruments: Vec<TradableInstrument> = self
            .get_json(Category::Instruments, "/equity/metadata/instruments")
            .await?;
        info!(count = instruments.len(), "Fetched instruments");
        Ok(instruments)
    }

    /// Get exchanges with their working schedules
    pub async fn fetch_exchanges(&self) -> BrokerResult<Vec<Exchange>> {
        let exchanges: Vec<Exchange> = self
            .get_json(Category::Exchanges, "/equity/metadata/exchanges")
            .await?;
        info!(count = exchanges.len(), "Fetched exchanges");
        Ok(exchanges)
    }
}

#[async_trait]
impl Broker for Trading212Client {
    async fn fetch_positions(&self) -> BrokerResult<Vec<Position>> {
        let raw: Vec<PortfolioPosition> =
            self.get_json(Category::Positions, "/equity/portfolio").await?;
        Ok(raw.into_iter().map(Position::from).collect())
    }

    async fn fetch_position(&self, ticker: &str) -> BrokerResult<Position> {
        let path = format!("/equity/portfolio/{}", ticker);
        match self.get_json::<PortfolioPosition>(Category::PositionSingle, &path).await {
            Ok(raw) => Ok(raw.into()),
            Err(BrokerError::NotFound(_)) => {
                info!(ticker, "No holding found for ticker");
                Err(BrokerError::NotFound(format!("no position in {}", ticker)))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_cash(&self) -> BrokerResult<Cash> {
        let raw: AccountCash = self.get_json(Category::Cash, "/equity/account/cash").await?;
        Ok(raw.into())
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<Order>> {
        let raw: Vec<EquityOrder> = self.get_json(Category::OrdersList, "/equity/orders").await?;
        let orders: Vec<Order> = raw.into_iter().map(Order::from).collect();
        for order in &orders {
            self.remember(order);
        }
        Ok(orders)
    }

    async fn fetch_order(&self, id: OrderId) -> BrokerResult<OrderLookup> {
        let path = format!("/equity/orders/{}", id);
        match self.get_json::<EquityOrder>(Category::OrderSingle, &path).await {
            Ok(raw) => {
                let order: Order = raw.into();
                self.remember(&order);
                let lookup = OrderLookup::from_listed(order);
                if !matches!(lookup, OrderLookup::StillOpen(_)) {
                    info!(id, lookup = ?lookup, "Order closed on broker");
                }
                Ok(lookup)
            }
            Err(BrokerError::NotFound(_)) => {
                let lookup = self.known_orders.lookup_missing(id);
                let filled = lookup == OrderLookup::Filled;
                info!(id, filled, "Order no longer listed");
                Ok(lookup)
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, id: OrderId) -> BrokerResult<CancelOutcome> {
        let path = format!("/equity/orders/{}", id);
        match self
            .send(Category::OrderCancel, self.client.delete(self.url(&path)))
            .await
        {
            Ok(_) => {
                info!(id, "Order cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            Err(BrokerError::NotFound(_)) => Ok(self.known_orders.cancel_missing(id)),
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(
        &self,
        ticker: &str,
        side: Side,
        quantity: f64,
    ) -> BrokerResult<Order> {
        let quantity = order_quantity(quantity)?;
        let payload = MarketOrderRequest {
            ticker: ticker.to_string(),
            quantity: signed_quantity(side, quantity),
            extended_hours: false,
        };

        let body = self
            .send(
                Category::OrderPlaceMarket,
                self.client.post(self.url("/equity/orders/market")).json(&payload),
            )
            .await?;
        let order: Order = decode::<EquityOrder>(&body)?.into();
        self.remember(&order);
        info!(id = order.id, ticker, side = %side, quantity, "Market order created");
        Ok(order)
    }
}

#[async_trait]
impl MetadataSource for Trading212Client {
    async fn instruments(&self) -> BrokerResult<Vec<TradableInstrument>> {
        self.fetch_instruments().await
    }

    async fn exchanges(&self) -> BrokerResult<Vec<Exchange>> {
        self.fetch_exchanges().await
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> BrokerResult<T> {
    serde_json::from_str(body).map_err(|e| BrokerError::Decode(format!("{}: {}", e, truncate(body, 200))))
}

/// Validate and round an order quantity before it goes on the wire
fn order_quantity(quantity: f64) -> BrokerResult<f64> {
    if !quantity.is_finite() {
        return Err(BrokerError::Validation(format!(
            "quantity must be finite, got {}",
            quantity
        )));
    }
    let rounded = truncate_quantity(quantity.abs(), QUANTITY_DECIMALS);
    if rounded <= 0.0 {
        return Err(BrokerError::Validation(format!(
            "quantity {} rounds to zero",
            quantity
        )));
    }
    Ok(rounded)
}

fn order_price(price: f64, label: &str) -> BrokerResult<f64> {
    if !price.is_finite() || price <= 0.0 {
        return Err(BrokerError::Validation(format!(
            "{} price must be positive, got {}",
            label, price
        )));
    }
    Ok((price * 1000.0).round() / 1000.0)
}
