use anyhow::{Context, Result};
use tokio::sync::watch;

use momentumbot::api::{BinanceTransport, ResilientExchangeClient};
use momentumbot::config::BotConfig;
use momentumbot::execution::ControlLoop;
use momentumbot::notify::{LogNotifier, NotificationSink, TelegramNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let config = BotConfig::from_env();
    tracing::info!("🚀 momentumbot starting");
    tracing::info!("  pairs: {:?}", config.trading_pairs);
    tracing::info!("  tick interval: {}s", config.tick_interval_secs);
    tracing::info!("  risk per trade: {}%", config.risk_per_trade_pct);
    tracing::info!("  max daily loss: {}%", config.max_daily_loss_pct);
    tracing::info!("  max open positions: {}", config.max_open_positions);

    let api_key = std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY not set")?;
    let api_secret =
        std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET not set")?;

    let transport = BinanceTransport::new(api_key, api_secret)?;
    let client = ResilientExchangeClient::new(transport, config.max_price_jump_pct);
    let notifier = create_notifier();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  received Ctrl+C, stopping after the current pair");
            let _ = stop_tx.send(true);
        }
    });

    ControlLoop::new(client, notifier, config, stop_rx).run().await?;

    tracing::info!("👋 momentumbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("momentumbot=info")),
        )
        .init();
}

fn create_notifier() -> Box<dyn NotificationSink> {
    match TelegramNotifier::from_env() {
        Ok(notifier) => {
            tracing::info!("Telegram notifications enabled");
            Box::new(notifier)
        }
        Err(err) => {
            tracing::warn!("{err}, notifications go to the log");
            Box::new(LogNotifier)
        }
    }
}
