use std::str::FromStr;
use std::time::Duration;

/// Immutable runtime configuration, passed into each component at
/// construction. Percent fields are whole percents (3.0 means 3%).
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub trading_pairs: Vec<String>,
    pub quote_asset: String,
    pub tick_interval_secs: u64,

    // Risk limits
    pub risk_per_trade_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_trail_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_open_positions: usize,

    // Signal thresholds
    pub entry_rsi_threshold: f64,
    pub volume_factor: f64,

    // Indicator windows
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub volume_window: usize,
    pub candle_window: usize,

    // Data quality
    pub max_price_jump_pct: f64,
    pub min_notional: f64,
    pub data_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading_pairs: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            quote_asset: "USDT".to_string(),
            tick_interval_secs: 60,
            risk_per_trade_pct: 3.0,
            stop_loss_pct: 5.0,
            take_profit_pct: 8.0,
            trailing_activation_pct: 2.0,
            trailing_trail_pct: 2.0,
            max_daily_loss_pct: 5.0,
            max_open_positions: 2,
            entry_rsi_threshold: 40.0,
            volume_factor: 1.5,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            volume_window: 20,
            candle_window: 50,
            max_price_jump_pct: 20.0,
            min_notional: 10.0,
            data_timeout_secs: 600,
        }
    }
}

impl BotConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(pairs) = std::env::var("TRADING_PAIRS") {
            let pairs: Vec<String> = pairs
                .split(',')
                .map(|p| p.trim().to_uppercase())
                .filter(|p| !p.is_empty())
                .collect();
            if !pairs.is_empty() {
                config.trading_pairs = pairs;
            }
        }
        if let Ok(asset) = std::env::var("QUOTE_ASSET") {
            config.quote_asset = asset.trim().to_uppercase();
        }

        set_from_env("TICK_INTERVAL_SECS", &mut config.tick_interval_secs);
        set_from_env("RISK_PER_TRADE_PCT", &mut config.risk_per_trade_pct);
        set_from_env("STOP_LOSS_PCT", &mut config.stop_loss_pct);
        set_from_env("TAKE_PROFIT_PCT", &mut config.take_profit_pct);
        set_from_env("TRAILING_ACTIVATION_PCT", &mut config.trailing_activation_pct);
        set_from_env("TRAILING_TRAIL_PCT", &mut config.trailing_trail_pct);
        set_from_env("MAX_DAILY_LOSS_PCT", &mut config.max_daily_loss_pct);
        set_from_env("MAX_OPEN_POSITIONS", &mut config.max_open_positions);
        set_from_env("ENTRY_RSI_THRESHOLD", &mut config.entry_rsi_threshold);
        set_from_env("VOLUME_FACTOR", &mut config.volume_factor);
        set_from_env("MAX_PRICE_JUMP_PCT", &mut config.max_price_jump_pct);
        set_from_env("MIN_NOTIONAL", &mut config.min_notional);
        set_from_env("DATA_TIMEOUT_SECS", &mut config.data_timeout_secs);

        config
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

fn set_from_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = BotConfig::default();

        assert!(config.stop_loss_pct > 0.0);
        assert!(config.take_profit_pct > config.trailing_activation_pct);
        assert!(config.macd_fast < config.macd_slow);
        // Window must cover the slowest indicator
        assert!(config.candle_window >= config.macd_slow + config.macd_signal - 1);
        assert!(config.candle_window >= config.rsi_period + 1);
        assert_eq!(config.trading_pairs, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MOMENTUMBOT_TEST_SLOT", "7");
        let mut slot = 2usize;
        set_from_env("MOMENTUMBOT_TEST_SLOT", &mut slot);
        assert_eq!(slot, 7);

        // Unparsable values leave the default in place
        std::env::set_var("MOMENTUMBOT_TEST_SLOT", "not-a-number");
        set_from_env("MOMENTUMBOT_TEST_SLOT", &mut slot);
        assert_eq!(slot, 7);
    }
}
