use std::{sync::Arc, time::Duration};

use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;

use kwbot_core::{
    commands::{CommandInterpreter, CommandListener, POLL_TIMEOUT},
    config::Config,
    fetch::PageFetcher,
    messaging::{
        port::{MessagingPort, UpdateSource},
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    monitor::Monitor,
    notify::Notifier,
    store::StateStore,
};

use crate::{TelegramMessenger, TelegramUpdates};

/// Bot client whose HTTP timeout outlasts a `getUpdates` long poll.
pub fn build_bot(token: &str) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(POLL_TIMEOUT + Duration::from_secs(15))
        .build()?;
    Ok(Bot::with_client(token, client))
}

/// Run the poll loop and the command listener until `cancel` fires.
pub async fn run(
    cfg: Arc<Config>,
    store: Arc<StateStore>,
    fetcher: Arc<dyn PageFetcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let bot = build_bot(&cfg.bot_token)?;

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "telegram bot connected"),
        Err(e) => tracing::warn!(error = %e, "getMe failed; continuing"),
    }
    // getUpdates is refused while a webhook is configured.
    if let Err(e) = bot.delete_webhook().await {
        tracing::warn!(error = %e, "deleteWebhook failed");
    }

    // Wrap the raw Telegram messenger with a throttling decorator so a burst of matches
    // does not trip 429s. The notifier still retries on RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let notifier = Notifier::new(
        messenger.clone(),
        cfg.chat_id,
        cfg.notify_attempts,
        cfg.notify_retry_delay,
    );
    let monitor = Monitor::new(&cfg, store.clone(), fetcher, Some(notifier));
    let listener = CommandListener::new(CommandInterpreter::new(store.clone(), cfg.chat_id));
    let updates: Arc<dyn UpdateSource> = Arc::new(TelegramUpdates::new(bot));

    // Either task ending (or panicking) stops the other.
    let poll_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _stop_all = cancel.clone().drop_guard();
            monitor.run(cancel).await;
        }
    });
    let command_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _stop_all = cancel.clone().drop_guard();
            listener.run(updates, messenger, cancel).await;
        }
    });

    let (poll_res, command_res) = tokio::join!(poll_task, command_task);
    for (name, res) in [("poll loop", poll_res), ("command listener", command_res)] {
        if let Err(e) = res {
            tracing::error!(task = name, error = %e, "task ended abnormally");
        }
    }

    let failures = store.storage_failures().await;
    if failures > 0 {
        tracing::warn!(failures, "state file writes failed during this run");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
