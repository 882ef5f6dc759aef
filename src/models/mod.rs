use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV candlestick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One pair's market data for a single tick.
///
/// Built fresh on every fetch and replaced wholesale; nothing mutates a
/// snapshot after construction.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub pair: String,
    pub price: f64,
    pub volume: f64,
    pub candles: Vec<Candle>,
    pub fetched_at: DateTime<Utc>,
}

/// Indicator values derived from a MarketSnapshot, recomputed each tick
#[derive(Debug, Clone, Copy)]
pub struct Indicators {
    pub rsi: f64,
    pub macd_histogram: f64,
    pub average_volume: f64,
}

/// Position direction. Only long entries are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
}

/// A single long position. Owned exclusively by PositionManager; other
/// components only see shared references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_stop: Option<f64>, // None until activation gain reached
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub pending_order_id: Option<String>, // exit order awaiting confirmation
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    /// Stop level currently in force: the ratcheted trailing stop once it
    /// sits above the initial stop-loss, the stop-loss otherwise.
    pub fn effective_stop(&self) -> f64 {
        match self.trailing_stop {
            Some(trailing) if trailing > self.stop_loss => trailing,
            _ => self.stop_loss,
        }
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.size
    }
}

/// Account-level state: quote balance and the daily loss counters.
/// Written only by PositionManager.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub balance: f64,
    pub daily_pnl: f64,
    pub day_start_balance: f64,
    pub entries_suspended: bool,
    pub last_reset: NaiveDate,
}

impl AccountState {
    pub fn new(balance: f64, today: NaiveDate) -> Self {
        Self {
            balance,
            daily_pnl: 0.0,
            day_start_balance: balance,
            entries_suspended: false,
            last_reset: today,
        }
    }

    /// Realized loss so far today, as a positive number (zero while the
    /// day is net profitable).
    pub fn daily_loss(&self) -> f64 {
        (-self.daily_pnl).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Intent for a single market order. The client order id makes a resend
/// of the same intent detectable on the exchange side.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Exchange view of an order after placement or a status poll
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: String,
    pub state: OrderState,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub pair: String,
    pub price: f64,
}
