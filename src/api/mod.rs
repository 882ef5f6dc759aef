// Exchange access layer
pub mod binance;
pub mod error;
pub mod resilient;

pub use binance::BinanceTransport;
pub use error::ExchangeError;
pub use resilient::{
    DiagnosticsSink, ResilientExchangeClient, RetryPolicy, TracingDiagnostics,
};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::{Candle, OrderFill, OrderRequest, Ticker};

/// Raw exchange REST surface.
///
/// Implementations classify every failure into an ExchangeError kind;
/// retry, backoff and cool-down policy live in ResilientExchangeClient.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Free balances per asset
    async fn get_balances(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError>;

    /// Most recent `limit` closed candles, oldest first
    async fn get_candles(&self, pair: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_market_order(&self, request: &OrderRequest)
        -> Result<OrderFill, ExchangeError>;

    async fn get_order_status(&self, pair: &str, order_id: &str)
        -> Result<OrderFill, ExchangeError>;

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), ExchangeError>;
}
