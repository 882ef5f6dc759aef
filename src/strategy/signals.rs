use crate::models::{ExitReason, Indicators, MarketSnapshot, Position};

/// Decision for one pair on one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSignal {
    Enter,
    Exit(ExitReason),
    Hold,
}

/// Pure mapping from indicators and position state to a trade decision.
///
/// Exit checks always run before entry checks: a pair holding a position
/// can only Hold or Exit on a given tick, so a freed slot is never
/// reused until the following tick.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    entry_rsi_threshold: f64,
    volume_factor: f64,
}

impl SignalEvaluator {
    pub fn new(entry_rsi_threshold: f64, volume_factor: f64) -> Self {
        Self {
            entry_rsi_threshold,
            volume_factor,
        }
    }

    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        indicators: &Indicators,
        position: Option<&Position>,
    ) -> TradeSignal {
        if let Some(position) = position {
            return self.evaluate_exit(snapshot.price, position);
        }
        self.evaluate_entry(snapshot, indicators)
    }

    fn evaluate_exit(&self, price: f64, position: &Position) -> TradeSignal {
        if price >= position.take_profit {
            return TradeSignal::Exit(ExitReason::TakeProfit);
        }

        if price <= position.effective_stop() {
            let reason = match position.trailing_stop {
                Some(trailing) if trailing > position.stop_loss => ExitReason::TrailingStop,
                _ => ExitReason::StopLoss,
            };
            return TradeSignal::Exit(reason);
        }

        TradeSignal::Hold
    }

    fn evaluate_entry(&self, snapshot: &MarketSnapshot, indicators: &Indicators) -> TradeSignal {
        let oversold = indicators.rsi < self.entry_rsi_threshold;
        let momentum_up = indicators.macd_histogram > 0.0;
        let volume_confirmed =
            snapshot.volume > indicators.average_volume * self.volume_factor;

        tracing::debug!(
            pair = %snapshot.pair,
            rsi = indicators.rsi,
            macd_histogram = indicators.macd_histogram,
            volume = snapshot.volume,
            average_volume = indicators.average_volume,
            "entry check: oversold={oversold} momentum={momentum_up} volume={volume_confirmed}"
        );

        if oversold && momentum_up && volume_confirmed {
            TradeSignal::Enter
        } else {
            TradeSignal::Hold
        }
    }
}
