use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::error::ExchangeError;
use super::ExchangeTransport;
use crate::models::{Candle, MarketSnapshot, OrderFill, OrderRequest, Ticker};

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Where classified call failures are reported, independent of the
/// control flow that handles them.
pub trait DiagnosticsSink: Send + Sync {
    fn record_failure(&self, operation: &str, error: &ExchangeError);
}

/// Default sink that forwards failures to the tracing pipeline
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record_failure(&self, operation: &str, error: &ExchangeError) {
        tracing::warn!(operation, %error, "exchange call failed");
    }
}

/// Retry budget for transient failures within a single call.
/// Rate-limit cool-downs never count against this budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// State for one resilient call; dropped when the call resolves
struct RetryContext {
    attempts: u32,
    backoff: Duration,
    next_allowed: Instant,
}

impl RetryContext {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempts: 0,
            backoff: policy.backoff_base,
            next_allowed: Instant::now(),
        }
    }

    fn register_failure(&mut self) {
        self.attempts += 1;
        self.next_allowed = Instant::now() + self.backoff;
        self.backoff *= 2;
    }
}

/// Fault-tolerant wrapper around an exchange transport.
///
/// Transient failures are retried in place with exponential backoff, an
/// exhausted budget degrades to `Unavailable`, rate limits start a
/// per-operation cool-down that defers the call to a later tick, and
/// market payloads are sanity-checked before anything downstream sees
/// them.
pub struct ResilientExchangeClient<T> {
    transport: T,
    policy: RetryPolicy,
    diagnostics: Box<dyn DiagnosticsSink>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    last_accepted: Mutex<HashMap<String, f64>>,
    last_rejected: Mutex<HashMap<String, f64>>,
    max_price_jump_pct: f64,
}

impl<T: ExchangeTransport> ResilientExchangeClient<T> {
    pub fn new(transport: T, max_price_jump_pct: f64) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            diagnostics: Box::new(TracingDiagnostics),
            cooldowns: Mutex::new(HashMap::new()),
            last_accepted: Mutex::new(HashMap::new()),
            last_rejected: Mutex::new(HashMap::new()),
            max_price_jump_pct,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Box<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub async fn get_balances(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        self.call("get_balances", |t| t.get_balances()).await
    }

    pub async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        self.call(&format!("get_ticker {pair}"), |t| t.get_ticker(pair))
            .await
    }

    pub async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        // The client order id keeps a retried placement a single intent
        self.call(&format!("place_order {}", request.pair), |t| {
            t.place_market_order(request)
        })
        .await
    }

    pub async fn get_order_status(
        &self,
        pair: &str,
        order_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        self.call(&format!("order_status {pair}"), |t| {
            t.get_order_status(pair, order_id)
        })
        .await
    }

    pub async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.call(&format!("cancel_order {pair}"), |t| {
            t.cancel_order(pair, order_id)
        })
        .await
    }

    /// Fetch and validate one pair's market view for this tick
    pub async fn fetch_snapshot(
        &self,
        pair: &str,
        window: usize,
    ) -> Result<MarketSnapshot, ExchangeError> {
        let candles = self
            .call(&format!("get_candles {pair}"), |t| {
                t.get_candles(pair, window)
            })
            .await?;
        let ticker = self
            .call(&format!("get_ticker {pair}"), |t| t.get_ticker(pair))
            .await?;

        match self.validate_snapshot(pair, &ticker, candles) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.diagnostics.record_failure(&format!("snapshot {pair}"), &err);
                Err(err)
            }
        }
    }

    async fn call<'a, F, Fut, P>(
        &'a self,
        operation: &str,
        call_fn: F,
    ) -> Result<P, ExchangeError>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<P, ExchangeError>>,
    {
        if let Some(remaining) = self.cooldown_remaining(operation) {
            let err = ExchangeError::RateLimited {
                retry_after: Some(remaining),
            };
            self.diagnostics.record_failure(operation, &err);
            return Err(err);
        }

        let mut context = RetryContext::new(&self.policy);
        loop {
            match call_fn(&self.transport).await {
                Ok(payload) => return Ok(payload),
                Err(err) => {
                    self.diagnostics.record_failure(operation, &err);
                    match err {
                        ExchangeError::Transient(last_error) => {
                            context.register_failure();
                            if context.attempts > self.policy.max_retries {
                                return Err(ExchangeError::Unavailable {
                                    attempts: context.attempts,
                                    last_error,
                                });
                            }
                            tracing::debug!(
                                operation,
                                attempt = context.attempts,
                                "retrying after transient failure"
                            );
                            tokio::time::sleep_until(context.next_allowed).await;
                        }
                        ExchangeError::RateLimited { retry_after } => {
                            self.begin_cooldown(
                                operation,
                                retry_after.unwrap_or(DEFAULT_COOLDOWN),
                            );
                            return Err(ExchangeError::RateLimited { retry_after });
                        }
                        other => return Err(other),
                    }
                }
            }
        }
    }

    fn cooldown_remaining(&self, operation: &str) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let until = cooldowns.get(operation).copied()?;
        let now = Instant::now();
        if now < until {
            Some(until - now)
        } else {
            cooldowns.remove(operation);
            None
        }
    }

    fn begin_cooldown(&self, operation: &str, wait: Duration) {
        let until = Instant::now() + wait;
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let entry = cooldowns.entry(operation.to_string()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    fn validate_snapshot(
        &self,
        pair: &str,
        ticker: &Ticker,
        candles: Vec<Candle>,
    ) -> Result<MarketSnapshot, ExchangeError> {
        if !ticker.price.is_finite() || ticker.price <= 0.0 {
            return Err(ExchangeError::DataValidation(format!(
                "non-positive price {} for {pair}",
                ticker.price
            )));
        }
        for candle in &candles {
            let prices = [candle.open, candle.high, candle.low, candle.close];
            if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err(ExchangeError::DataValidation(format!(
                    "bad candle prices for {pair} at {}",
                    candle.timestamp
                )));
            }
            if !candle.volume.is_finite() || candle.volume < 0.0 {
                return Err(ExchangeError::DataValidation(format!(
                    "bad candle volume for {pair} at {}",
                    candle.timestamp
                )));
            }
        }

        self.check_price_jump(pair, ticker.price)?;

        let volume = candles.last().map(|c| c.volume).unwrap_or(0.0);
        Ok(MarketSnapshot {
            pair: pair.to_string(),
            price: ticker.price,
            volume,
            candles,
            fetched_at: Utc::now(),
        })
    }

    /// Reject a price that moved implausibly far since the last accepted
    /// tick. A rejected level that repeats on the following tick is
    /// accepted as a genuine market move.
    fn check_price_jump(&self, pair: &str, price: f64) -> Result<(), ExchangeError> {
        let previous = {
            let last_accepted = self.last_accepted.lock().unwrap();
            last_accepted.get(pair).copied()
        };

        if let Some(previous) = previous {
            let jump_pct = ((price - previous) / previous).abs() * 100.0;
            if jump_pct > self.max_price_jump_pct {
                let mut last_rejected = self.last_rejected.lock().unwrap();
                let confirmed = last_rejected.get(pair).map_or(false, |&rejected| {
                    ((price - rejected) / rejected).abs() * 100.0 <= self.max_price_jump_pct
                });
                if !confirmed {
                    last_rejected.insert(pair.to_string(), price);
                    return Err(ExchangeError::DataValidation(format!(
                        "{pair} price jumped {jump_pct:.1}% in one tick ({previous} -> {price})"
                    )));
                }
            }
        }

        self.last_accepted
            .lock()
            .unwrap()
            .insert(pair.to_string(), price);
        self.last_rejected.lock().unwrap().remove(pair);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Transport whose responses are scripted per method
    #[derive(Default)]
    struct ScriptedTransport {
        ticker_calls: AtomicU32,
        ticker_script: Mutex<VecDeque<Result<Ticker, ExchangeError>>>,
        balance_calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn push_ticker(&self, result: Result<Ticker, ExchangeError>) {
            self.ticker_script.lock().unwrap().push_back(result);
        }

        fn ticker_ok(price: f64) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                pair: "BTCUSDT".to_string(),
                price,
            })
        }
    }

    #[async_trait]
    impl ExchangeTransport for Arc<ScriptedTransport> {
        async fn get_balances(&self) -> Result<HashMap<String, f64>, ExchangeError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([("USDT".to_string(), 1000.0)]))
        }

        async fn get_ticker(&self, _pair: &str) -> Result<Ticker, ExchangeError> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            self.ticker_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ScriptedTransport::ticker_ok(100.0))
        }

        async fn get_candles(
            &self,
            _pair: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(vec![])
        }

        async fn place_market_order(
            &self,
            _request: &OrderRequest,
        ) -> Result<OrderFill, ExchangeError> {
            unimplemented!("not used in these tests")
        }

        async fn get_order_status(
            &self,
            _pair: &str,
            _order_id: &str,
        ) -> Result<OrderFill, ExchangeError> {
            unimplemented!("not used in these tests")
        }

        async fn cancel_order(&self, _pair: &str, _order_id: &str) -> Result<(), ExchangeError> {
            unimplemented!("not used in these tests")
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> ResilientExchangeClient<Arc<ScriptedTransport>> {
        ResilientExchangeClient::new(transport, 20.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_then_success() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..3 {
            transport.push_ticker(Err(ExchangeError::Transient("timeout".to_string())));
        }
        transport.push_ticker(ScriptedTransport::ticker_ok(123.0));

        let client = client(transport.clone());
        let ticker = client.get_ticker("BTCUSDT").await.unwrap();

        assert!((ticker.price - 123.0).abs() < 1e-9);
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_degrades_to_unavailable() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..4 {
            transport.push_ticker(Err(ExchangeError::Transient("reset".to_string())));
        }

        let client = client(transport.clone());
        let err = client.get_ticker("BTCUSDT").await.unwrap_err();

        assert!(matches!(err, ExchangeError::Unavailable { attempts: 4, .. }));
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_starts_cooldown_without_consuming_budget() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ticker(Err(ExchangeError::RateLimited {
            retry_after: Some(Duration::from_secs(45)),
        }));

        let client = client(transport.clone());
        let err = client.get_ticker("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited { .. }));
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 1);

        // While cooling down the transport is never touched
        let err = client.get_ticker("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited { .. }));
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 1);

        // Other operations are unaffected by this pair's cool-down
        let balances = client.get_balances().await.unwrap();
        assert!((balances["USDT"] - 1000.0).abs() < 1e-9);

        // After the cool-down elapses, calls reach the exchange again
        tokio::time::advance(Duration::from_secs(46)).await;
        let ticker = client.get_ticker("BTCUSDT").await.unwrap();
        assert!((ticker.price - 100.0).abs() < 1e-9);
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_skip_retries() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ticker(Err(ExchangeError::Auth("bad key".to_string())));

        let client = client(transport.clone());
        let err = client.get_ticker("BTCUSDT").await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(transport.ticker_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_rejects_nonsense_price() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ticker(ScriptedTransport::ticker_ok(-5.0));

        let client = client(transport.clone());
        let err = client.fetch_snapshot("BTCUSDT", 50).await.unwrap_err();
        assert!(matches!(err, ExchangeError::DataValidation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_jump_discarded_then_confirmed() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ticker(ScriptedTransport::ticker_ok(100.0));
        transport.push_ticker(ScriptedTransport::ticker_ok(200.0));
        transport.push_ticker(ScriptedTransport::ticker_ok(201.0));

        let client = client(transport.clone());

        assert!(client.fetch_snapshot("BTCUSDT", 50).await.is_ok());

        // A 100% jump in one tick is discarded as bad data
        let err = client.fetch_snapshot("BTCUSDT", 50).await.unwrap_err();
        assert!(matches!(err, ExchangeError::DataValidation(_)));

        // The same level on the next tick is a real move
        let snapshot = client.fetch_snapshot("BTCUSDT", 50).await.unwrap();
        assert!((snapshot.price - 201.0).abs() < 1e-9);
    }
}
