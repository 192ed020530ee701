use std::{sync::Arc, time::Duration};

use tokio::time::sleep;

use crate::{
    domain::{ChatId, Match, MessageRef},
    errors::Error,
    formatting::format_match_html,
    messaging::port::MessagingPort,
    Result,
};

/// Cap for the locally computed backoff between delivery attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Delivers match notifications to the configured chat.
pub struct Notifier {
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
    attempts: u32,
    retry_delay: Duration,
}

impl Notifier {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        chat_id: ChatId,
        attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            messenger,
            chat_id,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Send one notification, retrying transient delivery failures.
    ///
    /// The returned error is the last attempt's; the caller decides what a loss means.
    pub async fn notify(&self, m: &Match) -> Result<MessageRef> {
        let html = format_match_html(m);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.messenger.send_html(self.chat_id, &html).await {
                Ok(msg) => return Ok(msg),
                Err(e) => e,
            };

            let retry_after = match &err {
                Error::Delivery {
                    permanent: false,
                    retry_after,
                    ..
                } => *retry_after,
                // Permanent delivery failures and anything non-delivery are final.
                _ => return Err(err),
            };
            if attempt >= self.attempts {
                return Err(err);
            }

            let wait = retry_after.unwrap_or_else(|| self.backoff(attempt));
            tracing::warn!(
                post_id = %m.post.id,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "notification failed, retrying"
            );
            sleep(wait).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}
