use crate::domain::{ChatId, MessageId};

/// A text message delivered to the bot, reduced to what command handling needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
}

/// One `poll` result. `next_offset` covers every update received, including ones
/// that produced no message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub messages: Vec<InboundMessage>,
    pub next_offset: Option<i64>,
}
