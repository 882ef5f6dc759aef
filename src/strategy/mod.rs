// Entry/exit signal evaluation
pub mod signals;

pub use signals::{SignalEvaluator, TradeSignal};
