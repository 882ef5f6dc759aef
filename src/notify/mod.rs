// Operator notifications. Best effort by contract: a failed send is the
// sink's problem, never the trading loop's.
pub mod telegram;

use async_trait::async_trait;

pub use telegram::TelegramNotifier;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

/// Fallback sink used when no Telegram credentials are configured
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!(target: "notify", "{message}");
        Ok(())
    }
}
