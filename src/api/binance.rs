use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;

use super::error::ExchangeError;
use super::ExchangeTransport;
use crate::models::{Candle, OrderFill, OrderRequest, OrderState, Ticker};

const API_BASE: &str = "https://api.binance.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CANDLE_INTERVAL: &str = "1m";
const MAX_REQUESTS_PER_SEC: u32 = 10;

type HmacSha256 = Hmac<Sha256>;
type Pacer = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Binance REST transport.
///
/// Signed endpoints carry an HMAC-SHA256 signature over the query string
/// plus the `X-MBX-APIKEY` header. All requests go through a client-side
/// pacer so the bot stays under the exchange request weight on its own.
pub struct BinanceTransport {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    pacer: Pacer,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

// ============== Implementation ==============

impl BinanceTransport {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        Self::with_base_url(API_BASE.to_string(), api_key, api_secret)
    }

    /// Custom base URL, used by tests to point at a local mock server
    pub fn with_base_url(
        base_url: String,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let per_second = NonZeroU32::new(MAX_REQUESTS_PER_SEC).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            pacer: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| ExchangeError::Auth("unusable API secret".to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Response, ExchangeError> {
        self.pacer.until_ready().await;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_reqwest)?;
        check_status(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<Response, ExchangeError> {
        self.pacer.until_ready().await;
        let timestamp = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("timestamp={timestamp}")
        } else {
            format!("{params}&timestamp={timestamp}")
        };
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(classify_reqwest)?;
        check_status(response).await
    }
}

#[async_trait]
impl ExchangeTransport for BinanceTransport {
    async fn get_balances(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let response = self
            .signed_request(Method::GET, "/api/v3/account", "")
            .await?;
        let account: AccountResponse = response.json().await.map_err(classify_reqwest)?;

        let mut balances = HashMap::new();
        for entry in account.balances {
            let free = parse_amount(&entry.free, "balance")?;
            if free > 0.0 {
                balances.insert(entry.asset, free);
            }
        }
        Ok(balances)
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        let query = format!("symbol={pair}");
        let response = self.public_get("/api/v3/ticker/price", &query).await?;
        let ticker: TickerResponse = response.json().await.map_err(classify_reqwest)?;
        Ok(Ticker {
            pair: ticker.symbol,
            price: parse_amount(&ticker.price, "ticker price")?,
        })
    }

    async fn get_candles(&self, pair: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!("symbol={pair}&interval={CANDLE_INTERVAL}&limit={limit}");
        let response = self.public_get("/api/v3/klines", &query).await?;
        let rows: Vec<Vec<serde_json::Value>> =
            response.json().await.map_err(classify_reqwest)?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={:.8}&newClientOrderId={}",
            request.pair,
            request.side.as_str(),
            request.quantity,
            request.client_order_id,
        );
        let response = self
            .signed_request(Method::POST, "/api/v3/order", &params)
            .await?;
        let order: OrderResponse = response.json().await.map_err(classify_reqwest)?;
        order_to_fill(order)
    }

    async fn get_order_status(
        &self,
        pair: &str,
        order_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        let params = format!("symbol={pair}&orderId={order_id}");
        let response = self
            .signed_request(Method::GET, "/api/v3/order", &params)
            .await?;
        let order: OrderResponse = response.json().await.map_err(classify_reqwest)?;
        order_to_fill(order)
    }

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={pair}&orderId={order_id}");
        self.signed_request(Method::DELETE, "/api/v3/order", &params)
            .await?;
        Ok(())
    }
}

// ============== Classification & Parsing ==============

fn classify_reqwest(err: reqwest::Error) -> ExchangeError {
    if err.is_decode() {
        ExchangeError::DataValidation(err.to_string())
    } else {
        // Timeouts, connection resets, DNS failures
        ExchangeError::Transient(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // 418 is Binance's auto-ban escalation of 429
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ExchangeError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_error_body(status, &body))
}

fn classify_error_body(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let (code, msg) = match parsed {
        Some(e) => (e.code, e.msg),
        None => (0, body.chars().take(120).collect()),
    };

    match code {
        -2014 | -2015 => return ExchangeError::Auth(msg),
        -1121 => return ExchangeError::InvalidSymbol(msg),
        -2010 => return ExchangeError::InsufficientBalance(msg),
        _ => {}
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExchangeError::Auth(msg)
    } else if status.is_server_error() {
        ExchangeError::Transient(format!("HTTP {status}: {msg}"))
    } else {
        ExchangeError::DataValidation(format!("unexpected HTTP {status}: {msg}"))
    }
}

fn parse_amount(value: &str, what: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::DataValidation(format!("unparsable {what}: {value:?}")))
}

fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::DataValidation("kline missing open time".to_string()))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| ExchangeError::DataValidation("kline open time out of range".to_string()))?;

    let field = |index: usize, name: &str| -> Result<f64, ExchangeError> {
        row.get(index)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| ExchangeError::DataValidation(format!("kline missing {name}")))
    };

    Ok(Candle {
        timestamp,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

fn parse_order_state(status: &str) -> Result<OrderState, ExchangeError> {
    match status {
        "NEW" => Ok(OrderState::New),
        "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
        "FILLED" => Ok(OrderState::Filled),
        "CANCELED" | "EXPIRED" => Ok(OrderState::Canceled),
        "REJECTED" => Ok(OrderState::Rejected),
        other => Err(ExchangeError::DataValidation(format!(
            "unknown order status {other:?}"
        ))),
    }
}

fn order_to_fill(order: OrderResponse) -> Result<OrderFill, ExchangeError> {
    let state = parse_order_state(&order.status)?;
    let executed_qty = match order.executed_qty.as_deref() {
        Some(qty) => parse_amount(qty, "executed quantity")?,
        None => 0.0,
    };
    let quote_qty = match order.cummulative_quote_qty.as_deref() {
        Some(qty) => parse_amount(qty, "quote quantity")?,
        None => 0.0,
    };
    let avg_price = if executed_qty > 0.0 && quote_qty > 0.0 {
        Some(quote_qty / executed_qty)
    } else {
        None
    };

    Ok(OrderFill {
        order_id: order.order_id.to_string(),
        state,
        executed_qty,
        avg_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_for(server: &mockito::ServerGuard) -> BinanceTransport {
        BinanceTransport::with_base_url(
            server.url(),
            "test-key".to_string(),
            "test-secret".to_string(),
        )
        .expect("transport builds")
    }

    #[tokio::test]
    async fn test_get_ticker_parses_price() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"50000.12"}"#)
            .create_async()
            .await;

        let transport = transport_for(&server);
        let ticker = transport.get_ticker("BTCUSDT").await.unwrap();
        assert_eq!(ticker.pair, "BTCUSDT");
        assert!((ticker.price - 50000.12).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_get_balances_keeps_only_funded_assets() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/account")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"balances":[
                    {"asset":"USDT","free":"1234.5","locked":"0"},
                    {"asset":"BTC","free":"0.02","locked":"0"},
                    {"asset":"DUST","free":"0.0","locked":"0"}
                ]}"#,
            )
            .create_async()
            .await;

        let transport = transport_for(&server);
        let balances = transport.get_balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert!((balances["USDT"] - 1234.5).abs() < 1e-9);
        assert!((balances["BTC"] - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_klines_parse_into_candles() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    [1700000000000,"100.0","101.0","99.0","100.5","1500.0",1700000059999,"0",10,"0","0","0"],
                    [1700000060000,"100.5","102.0","100.0","101.5","1800.0",1700000119999,"0",12,"0","0","0"]
                ]"#,
            )
            .create_async()
            .await;

        let transport = transport_for(&server);
        let candles = transport.get_candles("BTCUSDT", 2).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert!((candles[0].close - 100.5).abs() < 1e-9);
        assert!((candles[1].volume - 1800.0).abs() < 1e-9);
        assert!(candles[0].timestamp < candles[1].timestamp);
    }

    #[tokio::test]
    async fn test_429_classified_as_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "30")
            .with_body(r#"{"code":-1003,"msg":"Too many requests."}"#)
            .create_async()
            .await;

        let transport = transport_for(&server);
        let err = transport.get_ticker("BTCUSDT").await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }

    #[tokio::test]
    async fn test_5xx_classified_as_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let transport = transport_for(&server);
        let err = transport.get_ticker("BTCUSDT").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/account")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .with_body(r#"{"code":-2014,"msg":"API-key format invalid."}"#)
            .create_async()
            .await;

        let transport = transport_for(&server);
        let err = transport.get_balances().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let transport = transport_for(&server);
        let err = transport.get_ticker("NOPEUSDT").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidSymbol(_)));
    }

    #[tokio::test]
    async fn test_market_order_fill_averages_quote_quantity() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v3/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"orderId":42,"status":"FILLED","executedQty":"0.00120000","cummulativeQuoteQty":"60.00000000"}"#,
            )
            .create_async()
            .await;

        let transport = transport_for(&server);
        let request = OrderRequest {
            pair: "BTCUSDT".to_string(),
            side: crate::models::OrderSide::Buy,
            quantity: 0.0012,
            client_order_id: "abc".to_string(),
        };
        let fill = transport.place_market_order(&request).await.unwrap();
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.state, OrderState::Filled);
        assert!((fill.avg_price.unwrap() - 50_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_garbage_kline_rejected() {
        let row: Vec<serde_json::Value> =
            serde_json::from_str(r#"[1700000000000,"abc","101","99","100","1500"]"#).unwrap();
        let err = parse_kline(&row).unwrap_err();
        assert!(matches!(err, ExchangeError::DataValidation(_)));
    }
}
