use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::UpdateBatch,
    Result,
};

/// Outbound port. Telegram is the only implementation today.
///
/// Failures are `Error::Delivery`; adapters fill in `retry_after` when the API says so.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
}

/// Inbound port: long-poll for updates addressed to the bot.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Updates with `update_id >= offset`, waiting up to `timeout` for the first one.
    async fn poll(&self, offset: Option<i64>, timeout: Duration) -> Result<UpdateBatch>;
}
