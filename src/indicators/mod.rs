// Technical indicators module
// Implements RSI, EMA/SMA and the MACD histogram

pub mod engine;
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use engine::{IndicatorEngine, IndicatorError};
pub use macd::{calculate_macd_histogram, macd_min_bars};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
