//! Trading212Client against a local HTTP stub

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use levswap::broker::{Broker, BrokerError, RateLimiter, Trading212Client};
use levswap::types::{CancelOutcome, OrderLookup, OrderStatus, Side};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

type Route = dyn Fn(&str, &str) -> (u16, String) + Send + Sync;

struct Stub {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Stub {
    async fn start(route: impl Fn(&str, &str) -> (u16, String) + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let route = Arc::clone(&route);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve(stream, route, recorded).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}/api/v0", addr),
            requests,
        }
    }

    fn client(&self) -> Trading212Client {
        Trading212Client::new(
            &self.base_url,
            "test-key",
            Arc::new(RateLimiter::unlimited()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    route: Arc<Route>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name == "authorization" {
                authorization = Some(value.trim().to_string());
            }
        }
    }

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let (status, response_body) = route(&method, &path);
    recorded.lock().unwrap().push(Recorded {
        method,
        path,
        authorization,
        body,
    });

    let response = format!(
        "HTTP/1.1 {} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        response_body.len(),
        response_body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

const ORDER_JSON: &str = r#"{"id": 4242, "ticker": "US5Ld_EQ", "quantity": -19.99, "filledQuantity": 0, "type": "MARKET", "status": "NEW"}"#;

#[tokio::test]
async fn positions_and_cash_are_decoded_with_auth_header() {
    let stub = Stub::start(|_, path| match path {
        "/api/v0/equity/portfolio" => (
            200,
            r#"[{"ticker": "VUAAm_EQ", "quantity": 2.5, "averagePrice": 98.0, "currentPrice": 100.0, "ppl": 5.0}]"#
                .to_string(),
        ),
        "/api/v0/equity/account/cash" => (
            200,
            r#"{"free": 123.45, "total": 373.45, "invested": 245.0, "blocked": null, "ppl": 5.0, "result": 0, "pieCash": 0}"#
                .to_string(),
        ),
        _ => (404, String::new()),
    })
    .await;
    let client = stub.client();

    let positions = client.fetch_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].current_value(), 250.0);

    let cash = client.fetch_cash().await.unwrap();
    assert_eq!(cash.free, 123.45);
    assert_eq!(cash.blocked, 0.0);

    let requests = stub.requests();
    assert!(requests
        .iter()
        .all(|r| r.authorization.as_deref() == Some("test-key")));
}

#[tokio::test]
async fn sell_is_sent_as_negative_truncated_quantity() {
    let stub = Stub::start(|method, path| match (method, path) {
        ("POST", "/api/v0/equity/orders/market") => (200, ORDER_JSON.to_string()),
        _ => (404, String::new()),
    })
    .await;
    let client = stub.client();

    let order = client
        .place_market_order("US5Ld_EQ", Side::Sell, 19.999)
        .await
        .unwrap();
    assert_eq!(order.id, 4242);
    assert_eq!(order.side, Side::Sell);

    let requests = stub.requests();
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["quantity"], -19.99);
    assert_eq!(body["ticker"], "US5Ld_EQ");
    assert_eq!(body["extendedHours"], false);
}

#[tokio::test]
async fn missing_order_is_filled_only_when_known() {
    let stub = Stub::start(|method, path| match (method, path) {
        ("POST", "/api/v0/equity/orders/market") => (200, ORDER_JSON.to_string()),
        _ => (404, r#"{"code": "NotFound"}"#.to_string()),
    })
    .await;
    let client = stub.client();

    client
        .place_market_order("US5Ld_EQ", Side::Sell, 19.99)
        .await
        .unwrap();

    assert_eq!(client.fetch_order(4242).await.unwrap(), OrderLookup::Filled);
    assert_eq!(client.fetch_order(1).await.unwrap(), OrderLookup::NotFound);
    assert_eq!(
        client.cancel_order(4242).await.unwrap(),
        CancelOutcome::AlreadyClosed
    );
    assert_eq!(client.cancel_order(1).await.unwrap(), CancelOutcome::NotFound);
}

#[tokio::test]
async fn open_orders_are_remembered() {
    let stub = Stub::start(|method, path| match (method, path) {
        ("GET", "/api/v0/equity/orders") => (200, format!("[{}]", ORDER_JSON)),
        ("GET", "/api/v0/equity/orders/4242") => (200, ORDER_JSON.to_string()),
        ("DELETE", "/api/v0/equity/orders/4242") => (200, String::new()),
        _ => (404, String::new()),
    })
    .await;
    let client = stub.client();

    let open = client.list_open_orders().await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(matches!(
        client.fetch_order(4242).await.unwrap(),
        OrderLookup::StillOpen(o) if o.quantity == 19.99
    ));
    assert_eq!(client.cancel_order(4242).await.unwrap(), CancelOutcome::Cancelled);
}

#[tokio::test]
async fn terminal_order_status_is_not_reported_open() {
    let stub = Stub::start(|method, path| match (method, path) {
        ("GET", "/api/v0/equity/orders/4242") => (200, ORDER_JSON.replace("\"NEW\"", "\"FILLED\"")),
        ("GET", "/api/v0/equity/orders/4243") => (
            200,
            ORDER_JSON
                .replace("4242", "4243")
                .replace("\"NEW\"", "\"REJECTED\""),
        ),
        _ => (404, String::new()),
    })
    .await;
    let client = stub.client();

    assert_eq!(client.fetch_order(4242).await.unwrap(), OrderLookup::Filled);
    assert_eq!(
        client.fetch_order(4243).await.unwrap(),
        OrderLookup::Closed(OrderStatus::Rejected)
    );
    assert!(stub.requests().iter().all(|r| r.method == "GET"));
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let stub = Stub::start(|_, path| match path {
        "/api/v0/equity/portfolio" => (401, r#"{"code": "AuthenticationFailed"}"#.to_string()),
        "/api/v0/equity/account/cash" => (429, String::new()),
        "/api/v0/equity/portfolio/NOPE_EQ" => (404, String::new()),
        "/api/v0/equity/orders/market" => (400, r#"{"code": "InsufficientFreeForStocksBuy"}"#.to_string()),
        _ => (500, "oops".to_string()),
    })
    .await;
    let client = stub.client();

    assert!(matches!(client.fetch_positions().await, Err(BrokerError::Auth(_))));
    assert!(matches!(client.fetch_cash().await, Err(BrokerError::RateLimited(_))));
    assert!(matches!(
        client.fetch_position("NOPE_EQ").await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(matches!(
        client.place_market_order("US5Ld_EQ", Side::Buy, 1.0).await,
        Err(BrokerError::Validation(_))
    ));
    assert!(matches!(client.list_open_orders().await, Err(BrokerError::Network(_))));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let stub = Stub::start(|_, _| (200, "{\"unexpected\": true}".to_string())).await;
    let client = stub.client();

    let err = client.fetch_positions().await.unwrap_err();
    assert!(matches!(err, BrokerError::Decode(_)));
    assert!(err.is_transient());
}
