use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{AccountState, ExitReason, Position, PositionStatus, Side};

/// Sole owner of the position set and account state.
///
/// Every other component reads snapshots or proposes values; all
/// mutation happens here, serially, inside a single tick.
pub struct PositionManager {
    positions: Vec<Position>,
    account: AccountState,
    max_open_positions: usize,
}

impl PositionManager {
    pub fn new(initial_balance: f64, max_open_positions: usize, today: NaiveDate) -> Self {
        Self {
            positions: Vec::new(),
            account: AccountState::new(initial_balance, today),
            max_open_positions,
        }
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Positions still holding inventory (Open or Closing)
    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions
            .iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .count()
    }

    pub fn position_for(&self, pair: &str) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.pair == pair && p.status != PositionStatus::Closed)
    }

    /// Daily boundary check, run at the start of every tick. Resets the
    /// loss counters and the suspension flag exactly once per UTC day.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today == self.account.last_reset {
            return false;
        }
        self.account.daily_pnl = 0.0;
        self.account.entries_suspended = false;
        self.account.day_start_balance = self.account.balance;
        self.account.last_reset = today;
        true
    }

    /// Adopt the exchange-reported quote balance at the start of a tick.
    /// The first successful sync also seeds the day-start balance the
    /// daily loss limit is measured against.
    pub fn sync_balance(&mut self, balance: f64) {
        if self.account.day_start_balance <= 0.0 {
            self.account.day_start_balance = balance;
        }
        self.account.balance = balance;
    }

    pub fn suspend_entries(&mut self) {
        self.account.entries_suspended = true;
    }

    pub fn open_position(
        &mut self,
        pair: &str,
        entry_price: f64,
        size: f64,
        stop_loss: f64,
        take_profit: f64,
        opened_at: DateTime<Utc>,
    ) -> anyhow::Result<Uuid> {
        if self.position_for(pair).is_some() {
            anyhow::bail!("already holding a position in {pair}");
        }
        if self.open_position_count() >= self.max_open_positions {
            anyhow::bail!(
                "position cap reached ({} open)",
                self.open_position_count()
            );
        }
        if !(stop_loss < entry_price && entry_price < take_profit) {
            anyhow::bail!(
                "invalid levels for {pair}: stop {stop_loss} / entry {entry_price} / take-profit {take_profit}"
            );
        }
        if size <= 0.0 {
            anyhow::bail!("non-positive size {size} for {pair}");
        }

        let id = Uuid::new_v4();
        self.positions.push(Position {
            id,
            pair: pair.to_string(),
            side: Side::Long,
            entry_price,
            size,
            stop_loss,
            take_profit,
            trailing_stop: None,
            opened_at,
            status: PositionStatus::Open,
            pending_order_id: None,
            exit_price: None,
            closed_at: None,
            exit_reason: None,
            realized_pnl: None,
        });

        tracing::info!(
            pair,
            entry_price,
            size,
            stop_loss,
            take_profit,
            "position opened"
        );
        Ok(id)
    }

    /// Ratchet the trailing stop upward. A proposal at or below the
    /// current stop leaves it untouched; the stored value never retreats.
    pub fn raise_trailing_stop(&mut self, position_id: Uuid, proposal: f64) -> anyhow::Result<f64> {
        let position = self.get_live_mut(position_id)?;
        match position.trailing_stop {
            Some(existing) if proposal <= existing => Ok(existing),
            _ => {
                position.trailing_stop = Some(proposal);
                tracing::debug!(pair = %position.pair, trailing_stop = proposal, "trailing stop raised");
                Ok(proposal)
            }
        }
    }

    /// An exit order was submitted; remember it until the fill confirms
    pub fn mark_closing(
        &mut self,
        position_id: Uuid,
        order_id: String,
        reason: ExitReason,
    ) -> anyhow::Result<()> {
        let position = self.get_live_mut(position_id)?;
        position.status = PositionStatus::Closing;
        position.pending_order_id = Some(order_id);
        position.exit_reason = Some(reason);
        Ok(())
    }

    /// The pending exit order was canceled or rejected; the position is
    /// live again and will be re-evaluated next tick.
    pub fn revert_closing(&mut self, position_id: Uuid) -> anyhow::Result<()> {
        let position = self.get_live_mut(position_id)?;
        position.status = PositionStatus::Open;
        position.pending_order_id = None;
        position.exit_reason = None;
        Ok(())
    }

    /// Finalize a close at the confirmed fill price; updates the realized
    /// and daily P&L and the quote balance.
    pub fn close_position(
        &mut self,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| anyhow::anyhow!("position {position_id} not found"))?;
        if position.status == PositionStatus::Closed {
            anyhow::bail!("position {position_id} already closed");
        }

        let pnl = (exit_price - position.entry_price) * position.size;
        position.status = PositionStatus::Closed;
        position.pending_order_id = None;
        position.exit_price = Some(exit_price);
        position.closed_at = Some(closed_at);
        position.exit_reason = Some(reason);
        position.realized_pnl = Some(pnl);

        let pair = position.pair.clone();
        self.account.balance += pnl;
        self.account.daily_pnl += pnl;

        tracing::info!(pair, exit_price, pnl, ?reason, "position closed");
        Ok(pnl)
    }

    fn get_live_mut(&mut self, position_id: Uuid) -> anyhow::Result<&mut Position> {
        self.positions
            .iter_mut()
            .find(|p| p.id == position_id && p.status != PositionStatus::Closed)
            .ok_or_else(|| anyhow::anyhow!("no live position {position_id}"))
    }
}
