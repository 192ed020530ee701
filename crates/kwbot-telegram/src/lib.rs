//! Telegram adapter (teloxide).
//!
//! This crate implements the `kwbot-core` messaging ports over the Telegram Bot API:
//! `MessagingPort` for notifications and replies, `UpdateSource` for command polling.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{ParseMode, Update, UpdateKind},
    ApiError, RequestError,
};

use tokio::time::sleep;

pub mod router;

use kwbot_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::{MessagingPort, UpdateSource},
        types::{InboundMessage, UpdateBatch},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::RetryAfter(d) => Error::Delivery {
                reason: format!("telegram rate limit, retry after {}s", d.as_secs()),
                retry_after: Some(d),
                permanent: false,
            },
            RequestError::Api(api) => {
                let permanent = matches!(
                    api,
                    ApiError::NotFound // "Unauthorized" (invalid token) in teloxide-core 0.9
                        | ApiError::BotBlocked
                        | ApiError::ChatNotFound
                        | ApiError::BotKicked
                        | ApiError::UserDeactivated
                );
                Error::Delivery {
                    reason: format!("telegram error: {api}"),
                    retry_after: None,
                    permanent,
                }
            }
            other => Error::delivery(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        // Longer waits go back to the caller, which owns the retry budget.
        const MAX_INLINE_WAIT: Duration = Duration::from_secs(5);
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d)
                        if attempts < MAX_RETRIES && d <= MAX_INLINE_WAIT =>
                    {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

/// `getUpdates` long polling.
#[derive(Clone)]
pub struct TelegramUpdates {
    bot: Bot,
}

impl TelegramUpdates {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn poll(&self, offset: Option<i64>, timeout: Duration) -> Result<UpdateBatch> {
        let mut req = self
            .bot
            .get_updates()
            .timeout(u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX));
        if let Some(off) = offset {
            req = req.offset(i32::try_from(off).unwrap_or(i32::MAX));
        }

        let updates = req
            .await
            .map_err(|e| Error::Network(format!("telegram getUpdates: {e}")))?;

        Ok(UpdateBatch {
            next_offset: updates.iter().map(|u| i64::from(u.id) + 1).max(),
            messages: updates.iter().filter_map(inbound_from_update).collect(),
        })
    }
}

/// Text messages only; other update kinds are dropped.
pub fn inbound_from_update(update: &Update) -> Option<InboundMessage> {
    let UpdateKind::Message(msg) = &update.kind else {
        return None;
    };
    let text = msg.text()?;
    Some(InboundMessage {
        update_id: i64::from(update.id),
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        text: text.to_string(),
    })
}
