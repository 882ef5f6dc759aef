use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::NotificationSink;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Telegram Bot notifier
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            bot_token,
            chat_id,
        })
    }

    /// Requires TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN not set"))?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .map_err(|_| anyhow::anyhow!("TELEGRAM_CHAT_ID not set"))?;
        Self::new(bot_token, chat_id)
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text: message,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("telegram API error: {}", response.status());
        }
        Ok(())
    }
}
