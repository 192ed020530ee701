//! Fakes shared by the unit tests.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::{MessagingPort, UpdateSource},
        types::{InboundMessage, UpdateBatch},
    },
    Result,
};

/// Records sends; fails the first `fail_next` of them.
#[derive(Default)]
pub(crate) struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<(ChatId, String)>>,
    fail_next: Mutex<VecDeque<Error>>,
    send_delay: Duration,
}

impl FakeMessenger {
    pub(crate) fn failing(errors: Vec<Error>) -> Self {
        Self {
            fail_next: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    /// Every send stalls for `delay` after being counted.
    pub(crate) fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub(crate) fn sent_html(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub(crate) fn sent_to(&self) -> Vec<ChatId> {
        self.sends.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        *self.next_id.lock().unwrap() as usize
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let id = {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            *guard
        };
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if let Some(e) = self.fail_next.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.sends.lock().unwrap().push((chat_id, html.to_string()));
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(id),
        })
    }
}

/// Hands out scripted batches, then empty polls.
#[derive(Default)]
pub(crate) struct FakeUpdates {
    batches: Mutex<VecDeque<Result<Vec<InboundMessage>>>>,
    offsets: Mutex<Vec<Option<i64>>>,
}

impl FakeUpdates {
    pub(crate) fn new(batches: Vec<Result<Vec<InboundMessage>>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn offsets(&self) -> Vec<Option<i64>> {
        self.offsets.lock().unwrap().clone()
    }

    pub(crate) fn drained(&self) -> bool {
        self.batches.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl UpdateSource for FakeUpdates {
    async fn poll(&self, offset: Option<i64>, _timeout: Duration) -> Result<UpdateBatch> {
        self.offsets.lock().unwrap().push(offset);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => batch.map(|messages| UpdateBatch {
                next_offset: messages.iter().map(|m| m.update_id + 1).max(),
                messages,
            }),
            None => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(UpdateBatch::default())
            }
        }
    }
}

pub(crate) fn inbound(update_id: i64, chat_id: i64, message_id: i32, text: &str) -> InboundMessage {
    InboundMessage {
        update_id,
        chat_id: ChatId(chat_id),
        message_id: MessageId(message_id),
        text: text.to_string(),
    }
}
