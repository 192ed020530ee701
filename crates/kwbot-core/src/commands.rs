//! Chat commands that edit the keyword set while the poll loop keeps running.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, MessageId},
    formatting::escape_html,
    messaging::{
        port::{MessagingPort, UpdateSource},
        types::InboundMessage,
    },
    store::{KeywordChange, StateStore},
};

const RECENT_MESSAGES: usize = 256;
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

pub const HELP_TEXT: &str = "Commands:\n\
/add <keyword> - watch for a keyword\n\
/del <keyword> - stop watching a keyword\n\
/list - show watched keywords\n\
/help - show this message";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Add(String),
    Delete(String),
    List,
    Help,
    Unknown,
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if !text.starts_with('/') {
            return Self::Unknown;
        }
        let (cmd, arg) = split_command(text);
        match (cmd.as_str(), arg.is_empty()) {
            ("add", false) => Self::Add(arg),
            ("del" | "delete", false) => Self::Delete(arg),
            ("list", _) => Self::List,
            ("help" | "start", _) => Self::Help,
            _ => Self::Unknown,
        }
    }
}

fn split_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// Applies commands from the authorized chat to the store and produces replies.
pub struct CommandInterpreter {
    store: Arc<StateStore>,
    chat_id: ChatId,
    recent: VecDeque<MessageId>,
    recent_set: HashSet<MessageId>,
}

impl CommandInterpreter {
    pub fn new(store: Arc<StateStore>, chat_id: ChatId) -> Self {
        Self {
            store,
            chat_id,
            recent: VecDeque::with_capacity(RECENT_MESSAGES),
            recent_set: HashSet::with_capacity(RECENT_MESSAGES),
        }
    }

    /// Plain-text reply, or `None` when the message must be ignored silently
    /// (foreign chat or a re-delivery).
    pub async fn handle(&mut self, msg: &InboundMessage) -> Option<String> {
        if msg.chat_id != self.chat_id {
            tracing::warn!(chat_id = msg.chat_id.0, "ignoring message from unauthorized chat");
            return None;
        }
        if !self.remember(msg.message_id) {
            tracing::debug!(message_id = msg.message_id.0, "duplicate message ignored");
            return None;
        }

        let cmd = Command::parse(&msg.text);
        tracing::info!(command = ?cmd, "command received");
        Some(self.execute(cmd).await)
    }

    async fn execute(&self, cmd: Command) -> String {
        match cmd {
            Command::Add(raw) => match self.store.add_keyword(&raw).await {
                KeywordChange::Added(kw) => format!("Added keyword '{kw}'"),
                KeywordChange::AlreadyPresent(kw) => format!("'{kw}' is already present"),
                _ => usage_hint(),
            },
            Command::Delete(raw) => match self.store.remove_keyword(&raw).await {
                KeywordChange::Removed(kw) => format!("Removed keyword '{kw}'"),
                KeywordChange::NotFound(kw) => format!("'{kw}' not found"),
                _ => usage_hint(),
            },
            Command::List => {
                let kws = self.store.keywords().await;
                if kws.is_empty() {
                    "Keyword list is empty".to_string()
                } else {
                    let lines = kws
                        .iter()
                        .enumerate()
                        .map(|(i, k)| format!("{}. {k}", i + 1))
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("Keywords ({}):\n{lines}", kws.len())
                }
            }
            Command::Help => HELP_TEXT.to_string(),
            Command::Unknown => usage_hint(),
        }
    }

    /// `false` if `id` was handled recently.
    fn remember(&mut self, id: MessageId) -> bool {
        if !self.recent_set.insert(id) {
            return false;
        }
        self.recent.push_back(id);
        if self.recent.len() > RECENT_MESSAGES {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        true
    }
}

fn usage_hint() -> String {
    "Unknown command. Send /help for usage.".to_string()
}

/// Long-polls the update source and answers commands until cancelled.
pub struct CommandListener {
    interpreter: CommandInterpreter,
    poll_timeout: Duration,
    error_pause: Duration,
}

impl CommandListener {
    pub fn new(interpreter: CommandInterpreter) -> Self {
        Self {
            interpreter,
            poll_timeout: POLL_TIMEOUT,
            error_pause: POLL_ERROR_PAUSE,
        }
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub async fn run(
        mut self,
        source: Arc<dyn UpdateSource>,
        messenger: Arc<dyn MessagingPort>,
        cancel: CancellationToken,
    ) {
        let mut offset: Option<i64> = None;
        tracing::info!("command listener started");

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                res = source.poll(offset, self.poll_timeout) => res,
            };

            let batch = match polled {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "update poll failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.error_pause) => continue,
                    }
                }
            };

            if let Some(next) = batch.next_offset {
                offset = Some(offset.map_or(next, |o| o.max(next)));
            }
            for msg in batch.messages {
                let Some(reply) = self.interpreter.handle(&msg).await else {
                    continue;
                };
                if let Err(e) = messenger.send_html(msg.chat_id, &escape_html(&reply)).await {
                    tracing::warn!(error = %e, "failed to send command reply");
                }
            }
        }

        tracing::info!("command listener stopped");
    }
}
