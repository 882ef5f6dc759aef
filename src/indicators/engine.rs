use thiserror::Error;

use super::macd::{calculate_macd_histogram, macd_min_bars};
use super::moving_average::calculate_sma;
use super::rsi::calculate_rsi;
use crate::config::BotConfig;
use crate::models::{Indicators, MarketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndicatorError {
    #[error("insufficient history: have {have} bars, need {needed}")]
    InsufficientHistory { have: usize, needed: usize },
}

/// Derives the tick's indicator set from a market snapshot.
///
/// Pure computation over the snapshot's candle window; holds nothing but
/// the configured periods.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    rsi_period: usize,
    macd_fast: usize,
    macd_slow: usize,
    macd_signal: usize,
    volume_window: usize,
}

impl IndicatorEngine {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            rsi_period: config.rsi_period,
            macd_fast: config.macd_fast,
            macd_slow: config.macd_slow,
            macd_signal: config.macd_signal,
            volume_window: config.volume_window,
        }
    }

    /// Bars required before every indicator is defined
    pub fn min_bars(&self) -> usize {
        (self.rsi_period + 1)
            .max(macd_min_bars(self.macd_slow, self.macd_signal))
            .max(self.volume_window)
    }

    pub fn compute(&self, snapshot: &MarketSnapshot) -> Result<Indicators, IndicatorError> {
        let have = snapshot.candles.len();
        let needed = self.min_bars();
        if have < needed {
            return Err(IndicatorError::InsufficientHistory { have, needed });
        }

        let closes: Vec<f64> = snapshot.candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = snapshot.candles.iter().map(|c| c.volume).collect();

        let insufficient = IndicatorError::InsufficientHistory { have, needed };
        let rsi = calculate_rsi(&closes, self.rsi_period).ok_or(insufficient)?;
        let macd_histogram =
            calculate_macd_histogram(&closes, self.macd_fast, self.macd_slow, self.macd_signal)
                .ok_or(insufficient)?;
        let average_volume =
            calculate_sma(&volumes, self.volume_window).ok_or(insufficient)?;

        Ok(Indicators {
            rsi,
            macd_histogram,
            average_volume,
        })
    }
}
