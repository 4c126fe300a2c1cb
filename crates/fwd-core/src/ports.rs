//! Collaborators the engine is driven by and reports to.
//!
//! Telegram lives behind `Transport` in the adapter crate; a UI (or just the
//! log) lives behind `PresentationSink`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, HistoryMessage, MessageId, OutboundMessage, TopicId},
    errors::TransportError,
    ledger::{EntryKind, HistoryEntry},
};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Finite, lazily produced walk over a chat's messages.
#[async_trait]
pub trait MessageIter: Send {
    async fn next(&mut self) -> TransportResult<Option<HistoryMessage>>;
}

/// Outbound side of the chat service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn forward(&self, target: ChatId, msg: &OutboundMessage) -> TransportResult<()>;

    async fn send_topic(
        &self,
        target: ChatId,
        topic: TopicId,
        msg: &OutboundMessage,
    ) -> TransportResult<()>;

    async fn delete_message(&self, group: ChatId, message_id: MessageId) -> TransportResult<()>;

    /// Start a fresh walk over `group`'s messages. Each call restarts.
    async fn iter_messages(&self, group: ChatId) -> TransportResult<Box<dyn MessageIter>>;
}

/// Walks a pre-collected list; handy for adapters that index messages locally.
pub struct VecMessageIter {
    inner: std::vec::IntoIter<HistoryMessage>,
}

impl VecMessageIter {
    pub fn new(messages: Vec<HistoryMessage>) -> Self {
        Self {
            inner: messages.into_iter(),
        }
    }
}

#[async_trait]
impl MessageIter for VecMessageIter {
    async fn next(&mut self) -> TransportResult<Option<HistoryMessage>> {
        Ok(self.inner.next())
    }
}

/// Fire-and-forget notifications. Implementations must not block.
pub trait PresentationSink: Send + Sync {
    fn on_log(&self, line: String);
    fn on_history_updated(&self, entry: &HistoryEntry);
    fn on_stats_updated(&self, target: ChatId, kind: EntryKind, count: u64);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn on_log(&self, _line: String) {}
    fn on_history_updated(&self, _entry: &HistoryEntry) {}
    fn on_stats_updated(&self, _target: ChatId, _kind: EntryKind, _count: u64) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Log(String),
    History(HistoryEntry),
    Stats {
        target: ChatId,
        kind: EntryKind,
        count: u64,
    },
}

/// Buffered sink over a bounded channel. Events are dropped when the consumer
/// falls behind.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, ev: SinkEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(ev) {
            tracing::debug!("presentation sink full; dropping event");
        }
    }
}

impl PresentationSink for ChannelSink {
    fn on_log(&self, line: String) {
        self.push(SinkEvent::Log(line));
    }

    fn on_history_updated(&self, entry: &HistoryEntry) {
        self.push(SinkEvent::History(entry.clone()));
    }

    fn on_stats_updated(&self, target: ChatId, kind: EntryKind, count: u64) {
        self.push(SinkEvent::Stats {
            target,
            kind,
            count,
        });
    }
}
