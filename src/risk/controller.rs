use thiserror::Error;

use crate::config::BotConfig;
use crate::models::{AccountState, Position};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("invalid price levels: {0}")]
    InvalidLevels(String),
}

/// Why a new entry was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryVeto {
    EntriesSuspended,
    DailyLossLimit,
    PositionCap,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Enforces sizing, stop/take-profit levels, the daily loss limit and
/// the open-position cap. Proposes values only; PositionManager applies
/// them.
#[derive(Debug, Clone)]
pub struct RiskController {
    risk_per_trade_pct: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    trailing_activation_pct: f64,
    trailing_trail_pct: f64,
    max_daily_loss_pct: f64,
    max_open_positions: usize,
    min_notional: f64,
}

impl RiskController {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            risk_per_trade_pct: config.risk_per_trade_pct,
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            trailing_activation_pct: config.trailing_activation_pct,
            trailing_trail_pct: config.trailing_trail_pct,
            max_daily_loss_pct: config.max_daily_loss_pct,
            max_open_positions: config.max_open_positions,
            min_notional: config.min_notional,
        }
    }

    pub fn max_open_positions(&self) -> usize {
        self.max_open_positions
    }

    /// Cumulative realized loss today at or past the configured fraction
    /// of the day-start balance.
    pub fn daily_loss_breached(&self, account: &AccountState) -> bool {
        account.day_start_balance > 0.0
            && account.daily_loss()
                >= account.day_start_balance * self.max_daily_loss_pct / 100.0
    }

    /// Entry authorization. Exits are never subject to these checks.
    pub fn authorize_entry(
        &self,
        account: &AccountState,
        open_positions: usize,
    ) -> Result<(), EntryVeto> {
        if account.entries_suspended {
            return Err(EntryVeto::EntriesSuspended);
        }
        if self.daily_loss_breached(account) {
            return Err(EntryVeto::DailyLossLimit);
        }
        if open_positions >= self.max_open_positions {
            return Err(EntryVeto::PositionCap);
        }
        Ok(())
    }

    pub fn entry_levels(&self, entry_price: f64) -> PriceLevels {
        PriceLevels {
            stop_loss: entry_price * (1.0 - self.stop_loss_pct / 100.0),
            take_profit: entry_price * (1.0 + self.take_profit_pct / 100.0),
        }
    }

    /// Risk-based sizing: the dollar loss at the stop equals
    /// `risk_per_trade_pct` of the balance, clamped so the notional never
    /// exceeds the balance itself.
    pub fn position_size(
        &self,
        balance: f64,
        entry_price: f64,
        stop_loss: f64,
    ) -> Result<f64, RiskError> {
        if balance <= 0.0 {
            return Err(RiskError::InsufficientBalance(format!(
                "balance ${balance:.2}"
            )));
        }
        let per_unit_risk = entry_price - stop_loss;
        if per_unit_risk <= 0.0 || entry_price <= 0.0 {
            return Err(RiskError::InvalidLevels(format!(
                "stop {stop_loss} not below entry {entry_price}"
            )));
        }

        let risk_budget = balance * self.risk_per_trade_pct / 100.0;
        let size = (risk_budget / per_unit_risk).min(balance / entry_price);

        let notional = size * entry_price;
        if notional < self.min_notional {
            return Err(RiskError::InsufficientBalance(format!(
                "notional ${notional:.2} below exchange minimum ${:.2}",
                self.min_notional
            )));
        }

        Ok(size)
    }

    /// Trailing stop proposal for this tick, None until the activation
    /// gain is reached. The stored stop only ever moves up; that ratchet
    /// is PositionManager's job.
    pub fn trailing_stop_proposal(&self, position: &Position, price: f64) -> Option<f64> {
        if position.entry_price <= 0.0 {
            return None;
        }
        let gain_pct = (price - position.entry_price) / position.entry_price * 100.0;
        if gain_pct < self.trailing_activation_pct {
            return None;
        }
        Some(price * (1.0 - self.trailing_trail_pct / 100.0))
    }
}
