use std::fmt;

use serde::{Deserialize, Serialize};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric). Groups, supergroups and channels are negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i32);

/// Forum topic (message thread) id inside a supergroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media attached to an inbound message (only the kind matters to the engine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Other,
}

/// Inbound message event as pushed by the event source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub source: ChatId,
    pub sender: Option<UserId>,
    pub message_id: MessageId,
    /// Text or caption; empty for pure media.
    pub text: String,
    pub media: Option<MediaKind>,
}

impl InboundMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: self.source,
            message_id: self.message_id,
        }
    }
}

/// What a lane hands to the transport.
///
/// `text` is `Some` only when a transformer rewrote the message; transports then
/// send the new text instead of forwarding the original.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub origin: MessageRef,
    pub text: Option<String>,
}

/// One message from a chat's history, as yielded by `Transport::iter_messages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryMessage {
    pub message_id: MessageId,
    pub is_forward: bool,
}
