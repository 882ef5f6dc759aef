use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::PositionManager;
use crate::api::{ExchangeError, ExchangeTransport, ResilientExchangeClient};
use crate::config::BotConfig;
use crate::indicators::{IndicatorEngine, IndicatorError};
use crate::models::{
    ExitReason, MarketSnapshot, OrderFill, OrderRequest, OrderSide, OrderState, PositionStatus,
};
use crate::notify::NotificationSink;
use crate::risk::RiskController;
use crate::strategy::{SignalEvaluator, TradeSignal};

/// Fixed-interval trading loop.
///
/// One tick runs at a time; a tick that overruns the interval delays the
/// next one instead of overlapping it. The stop signal is observed
/// between pairs and between ticks, never mid-order.
pub struct ControlLoop<T: ExchangeTransport> {
    client: ResilientExchangeClient<T>,
    engine: IndicatorEngine,
    evaluator: SignalEvaluator,
    risk: RiskController,
    positions: PositionManager,
    notifier: Box<dyn NotificationSink>,
    config: BotConfig,
    stop: watch::Receiver<bool>,
    last_fresh: HashMap<String, DateTime<Utc>>,
    stale_reported: HashSet<String>,
    fatal_reported: HashSet<String>,
    balance_failures: u32,
}

impl<T: ExchangeTransport> ControlLoop<T> {
    pub fn new(
        client: ResilientExchangeClient<T>,
        notifier: Box<dyn NotificationSink>,
        config: BotConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let engine = IndicatorEngine::new(&config);
        let evaluator = SignalEvaluator::new(config.entry_rsi_threshold, config.volume_factor);
        let risk = RiskController::new(&config);
        let positions =
            PositionManager::new(0.0, config.max_open_positions, Utc::now().date_naive());

        Self {
            client,
            engine,
            evaluator,
            risk,
            positions,
            notifier,
            config,
            stop,
            last_fresh: HashMap::new(),
            stale_reported: HashSet::new(),
            fatal_reported: HashSet::new(),
            balance_failures: 0,
        }
    }

    pub fn position_manager(&self) -> &PositionManager {
        &self.positions
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(pairs = ?self.config.trading_pairs, "control loop starting");
        self.reconcile_startup().await;
        self.notify(&format!(
            "🤖 trading bot started ({} pairs, {}s tick)",
            self.config.trading_pairs.len(),
            self.config.tick_interval_secs
        ))
        .await;

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.run_tick().await;
            if self.stopped() {
                break;
            }
        }

        self.notify("🛑 trading bot stopped").await;
        Ok(())
    }

    /// One full cycle over all configured pairs
    pub async fn run_tick(&mut self) {
        let now = Utc::now();
        if self.positions.roll_daily(now) {
            tracing::info!("UTC day boundary crossed, daily loss counters reset");
        }

        self.refresh_balance().await;

        let pairs = self.config.trading_pairs.clone();
        for pair in &pairs {
            if self.stopped() {
                return;
            }
            self.process_pair(pair, now).await;
        }

        self.send_heartbeat().await;
    }

    /// Adopt pre-existing holdings at startup so a restart cannot leave
    /// live inventory unmanaged or double-buy into it.
    pub async fn reconcile_startup(&mut self) {
        let balances = match self.client.get_balances().await {
            Ok(balances) => balances,
            Err(err) => {
                tracing::warn!(%err, "startup reconciliation skipped, no balance data");
                return;
            }
        };

        let quote = balances
            .get(&self.config.quote_asset)
            .copied()
            .unwrap_or(0.0);
        self.positions.sync_balance(quote);
        tracing::info!(balance = quote, "exchange balance loaded");

        for pair in self.config.trading_pairs.clone() {
            let Some(base) = pair.strip_suffix(&self.config.quote_asset) else {
                continue;
            };
            let held = balances.get(base).copied().unwrap_or(0.0);
            if held <= 0.0 {
                continue;
            }
            let ticker = match self.client.get_ticker(&pair).await {
                Ok(ticker) => ticker,
                Err(err) => {
                    tracing::warn!(pair, %err, "could not price existing holding");
                    continue;
                }
            };
            if held * ticker.price < self.config.min_notional {
                continue; // dust
            }

            let levels = self.risk.entry_levels(ticker.price);
            match self.positions.open_position(
                &pair,
                ticker.price,
                held,
                levels.stop_loss,
                levels.take_profit,
                Utc::now(),
            ) {
                Ok(_) => {
                    self.notify(&format!(
                        "♻️ adopted existing {held:.6} {base} @ ${:.2} from a previous run",
                        ticker.price
                    ))
                    .await;
                }
                Err(err) => tracing::warn!(pair, %err, "could not adopt existing holding"),
            }
        }
    }

    async fn refresh_balance(&mut self) {
        match self.client.get_balances().await {
            Ok(balances) => {
                self.balance_failures = 0;
                let quote = balances
                    .get(&self.config.quote_asset)
                    .copied()
                    .unwrap_or(0.0);
                self.positions.sync_balance(quote);
            }
            Err(err) => {
                self.balance_failures += 1;
                tracing::warn!(
                    %err,
                    failures = self.balance_failures,
                    "balance refresh failed, using last known balance"
                );
                if self.balance_failures == 3 {
                    self.notify("⚠️ balance unavailable for 3 consecutive ticks")
                        .await;
                }
            }
        }
    }

    async fn process_pair(&mut self, pair: &str, now: DateTime<Utc>) {
        let snapshot = match self
            .client
            .fetch_snapshot(pair, self.config.candle_window)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.handle_fetch_failure(pair, now, err).await;
                return;
            }
        };
        self.last_fresh.insert(pair.to_string(), now);
        self.stale_reported.remove(pair);
        self.fatal_reported.remove(pair);

        // Settle an exit order still in flight; whatever the outcome, the
        // pair gets no new decision until the following tick.
        if self
            .positions
            .position_for(pair)
            .map_or(false, |p| p.status == PositionStatus::Closing)
        {
            self.reconcile_closing(pair, snapshot.price, now).await;
            return;
        }

        let indicators = match self.engine.compute(&snapshot) {
            Ok(indicators) => indicators,
            Err(IndicatorError::InsufficientHistory { have, needed }) => {
                tracing::info!(pair, have, needed, "collecting history, skipping evaluation");
                return;
            }
        };

        // Trailing ratchet runs before the exit check so the stop in
        // force this tick reflects the latest confirmed price.
        let trailing = match self.positions.position_for(pair) {
            Some(position) if position.status == PositionStatus::Open => self
                .risk
                .trailing_stop_proposal(position, snapshot.price)
                .map(|proposal| (position.id, proposal)),
            _ => None,
        };
        if let Some((id, proposal)) = trailing {
            if let Err(err) = self.positions.raise_trailing_stop(id, proposal) {
                tracing::warn!(pair, %err, "trailing stop update failed");
            }
        }

        let signal = self.evaluator.evaluate(
            &snapshot,
            &indicators,
            self.positions.position_for(pair),
        );

        match signal {
            TradeSignal::Exit(reason) => {
                self.execute_exit(pair, reason, snapshot.price, now).await
            }
            TradeSignal::Enter => self.try_enter(pair, &snapshot, now).await,
            TradeSignal::Hold => {}
        }
    }

    async fn handle_fetch_failure(&mut self, pair: &str, now: DateTime<Utc>, err: ExchangeError) {
        if err.is_fatal() {
            tracing::error!(pair, %err, "exchange error needs operator attention");
            if self.fatal_reported.insert(pair.to_string()) {
                self.notify(&format!("🚨 {pair}: {err}")).await;
            }
            return;
        }

        tracing::warn!(pair, %err, "no fresh data this tick");

        // Sustained blackout: warn the operator once. An exit is never
        // forced without a live price.
        let stale_secs = self
            .last_fresh
            .get(pair)
            .map(|last| (now - *last).num_seconds());
        if let Some(stale_secs) = stale_secs {
            if stale_secs >= self.config.data_timeout_secs as i64
                && !self.stale_reported.contains(pair)
            {
                self.stale_reported.insert(pair.to_string());
                self.notify(&format!(
                    "⚠️ {pair}: no valid market data for {} minutes, any open position is unmanaged",
                    stale_secs / 60
                ))
                .await;
            }
        }
    }

    async fn try_enter(&mut self, pair: &str, snapshot: &MarketSnapshot, now: DateTime<Utc>) {
        let account = self.positions.account();
        if let Err(veto) = self
            .risk
            .authorize_entry(account, self.positions.open_position_count())
        {
            tracing::debug!(pair, ?veto, "entry not authorized");
            return;
        }
        let balance = account.balance;

        let levels = self.risk.entry_levels(snapshot.price);
        let size = match self
            .risk
            .position_size(balance, snapshot.price, levels.stop_loss)
        {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!(pair, %err, "entry sizing refused");
                self.notify(&format!("⚠️ {pair} entry skipped: {err}")).await;
                return;
            }
        };

        let request = OrderRequest {
            pair: pair.to_string(),
            side: OrderSide::Buy,
            quantity: size,
            client_order_id: Uuid::new_v4().to_string(),
        };
        let fill = match self.client.place_market_order(&request).await {
            Ok(fill) => fill,
            Err(err) => {
                tracing::warn!(pair, %err, "entry order not placed");
                if !err.is_absorbed() {
                    self.notify(&format!("🚨 {pair} buy order failed: {err}")).await;
                }
                return;
            }
        };

        let fill = match self.resolve_fill(pair, fill).await {
            Ok(fill) => fill,
            Err(order_id) => {
                // An unconfirmed buy is withdrawn rather than guessed at
                match self.client.cancel_order(pair, &order_id).await {
                    Ok(()) => {
                        tracing::warn!(pair, order_id, "unconfirmed buy order canceled")
                    }
                    Err(err) => {
                        tracing::error!(pair, order_id, %err, "could not cancel unconfirmed buy order");
                        self.notify(&format!(
                            "🚨 {pair}: buy order {order_id} unconfirmed and not canceled, check the exchange"
                        ))
                        .await;
                    }
                }
                return;
            }
        };

        let entry_price = fill.avg_price.unwrap_or(snapshot.price);
        let executed = if fill.executed_qty > 0.0 {
            fill.executed_qty
        } else {
            size
        };
        // Levels derive from the confirmed fill, not the pre-trade quote
        let levels = self.risk.entry_levels(entry_price);
        match self.positions.open_position(
            pair,
            entry_price,
            executed,
            levels.stop_loss,
            levels.take_profit,
            now,
        ) {
            Ok(_) => {
                self.notify(&format!(
                    "📈 opened {executed:.6} {pair} @ ${entry_price:.2} (stop ${:.2}, target ${:.2})",
                    levels.stop_loss, levels.take_profit
                ))
                .await;
            }
            Err(err) => tracing::error!(pair, %err, "position could not be registered"),
        }
    }

    async fn execute_exit(
        &mut self,
        pair: &str,
        reason: ExitReason,
        price: f64,
        now: DateTime<Utc>,
    ) {
        let Some((id, size)) = self
            .positions
            .position_for(pair)
            .map(|p| (p.id, p.size))
        else {
            return;
        };

        let request = OrderRequest {
            pair: pair.to_string(),
            side: OrderSide::Sell,
            quantity: size,
            client_order_id: Uuid::new_v4().to_string(),
        };
        let fill = match self.client.place_market_order(&request).await {
            Ok(fill) => fill,
            Err(err) => {
                tracing::warn!(pair, %err, "exit order not placed, position stays open");
                if !err.is_absorbed() {
                    self.notify(&format!("⚠️ {pair} exit order failed: {err}")).await;
                }
                return;
            }
        };

        match self.resolve_fill(pair, fill).await {
            Ok(fill) => {
                let exit_price = fill.avg_price.unwrap_or(price);
                self.finalize_close(pair, id, exit_price, reason, now).await;
            }
            Err(order_id) => {
                // Keep the slot occupied; reconcile the order next tick
                if let Err(err) = self.positions.mark_closing(id, order_id, reason) {
                    tracing::error!(pair, %err, "could not mark position closing");
                }
            }
        }
    }

    /// Check on a pending exit order from an earlier tick
    async fn reconcile_closing(&mut self, pair: &str, fallback_price: f64, now: DateTime<Utc>) {
        let pending = self
            .positions
            .position_for(pair)
            .map(|p| (p.id, p.pending_order_id.clone(), p.exit_reason));
        let Some((id, order_id, reason)) = pending else {
            return;
        };
        let Some(order_id) = order_id else {
            if let Err(err) = self.positions.revert_closing(id) {
                tracing::error!(pair, %err, "could not revert closing position");
            }
            return;
        };
        let reason = reason.unwrap_or(ExitReason::StopLoss);

        match self.client.get_order_status(pair, &order_id).await {
            Ok(fill) if fill.state == OrderState::Filled => {
                let exit_price = fill.avg_price.unwrap_or(fallback_price);
                self.finalize_close(pair, id, exit_price, reason, now).await;
            }
            Ok(fill) if matches!(fill.state, OrderState::Canceled | OrderState::Rejected) => {
                tracing::warn!(pair, order_id, state = ?fill.state, "exit order did not fill, position live again");
                if let Err(err) = self.positions.revert_closing(id) {
                    tracing::error!(pair, %err, "could not revert closing position");
                }
            }
            Ok(_) => {} // still working, check again next tick
            Err(err) => {
                tracing::warn!(pair, %err, "exit order status unknown, retrying next tick")
            }
        }
    }

    async fn finalize_close(
        &mut self,
        pair: &str,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) {
        let pnl = match self
            .positions
            .close_position(position_id, exit_price, reason, now)
        {
            Ok(pnl) => pnl,
            Err(err) => {
                tracing::error!(pair, %err, "close could not be applied");
                return;
            }
        };
        self.notify(&format!(
            "💰 closed {pair} @ ${exit_price:.2}, P&L ${pnl:+.2} ({reason:?})"
        ))
        .await;

        let breached = {
            let account = self.positions.account();
            !account.entries_suspended && self.risk.daily_loss_breached(account)
        };
        if breached {
            self.positions.suspend_entries();
            self.notify("🛑 daily loss limit reached, new entries suspended until the next UTC day")
                .await;
        }
    }

    /// Resolve a just-placed market order to a terminal fill, polling the
    /// status once. Err carries the order id of an order still working.
    async fn resolve_fill(&self, pair: &str, fill: OrderFill) -> Result<OrderFill, String> {
        if fill.state == OrderState::Filled {
            return Ok(fill);
        }
        let order_id = fill.order_id.clone();
        match self.client.get_order_status(pair, &order_id).await {
            Ok(confirmed) if confirmed.state == OrderState::Filled => Ok(confirmed),
            Ok(_) | Err(_) => Err(order_id),
        }
    }

    async fn send_heartbeat(&mut self) {
        let account = self.positions.account();
        let message = format!(
            "💓 balance ${:.2} | open positions {} | daily P&L ${:+.2}",
            account.balance,
            self.positions.open_position_count(),
            account.daily_pnl
        );
        self.notify(&message).await;
    }

    /// Best effort: a failed notification is logged, never retried here
    async fn notify(&self, message: &str) {
        if let Err(err) = self.notifier.send(message).await {
            tracing::warn!(%err, "notification failed");
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }
}
