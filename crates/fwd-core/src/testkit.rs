//! Scripted transport shared by the engine and sweep tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    domain::{ChatId, HistoryMessage, MessageId, OutboundMessage, TopicId},
    errors::TransportError,
    ports::{MessageIter, Transport, TransportResult, VecMessageIter},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentVia {
    Forward,
    Topic(TopicId),
}

#[derive(Clone, Debug)]
pub struct Call {
    pub target: ChatId,
    pub via: SentVia,
    pub msg: OutboundMessage,
    pub at: Instant,
}

#[derive(Default)]
pub struct FakeTransport {
    sends: Mutex<HashMap<ChatId, VecDeque<TransportResult<()>>>>,
    calls: Mutex<Vec<Call>>,
    histories: Mutex<HashMap<ChatId, Vec<HistoryMessage>>>,
    deletes: Mutex<HashMap<(ChatId, MessageId), VecDeque<TransportResult<()>>>>,
    deleted: Mutex<Vec<(ChatId, MessageId, Instant)>>,
    listing_errors: Mutex<HashMap<ChatId, TransportError>>,
}

impl FakeTransport {
    /// Queue results for sends to `target`; once drained, sends succeed.
    pub fn script(&self, target: ChatId, results: Vec<TransportResult<()>>) {
        self.sends
            .lock()
            .unwrap()
            .entry(target)
            .or_default()
            .extend(results);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, target: ChatId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.target == target)
            .collect()
    }

    /// Messages returned by `iter_messages(group)`, newest first.
    pub fn set_history(&self, group: ChatId, messages: Vec<HistoryMessage>) {
        self.histories.lock().unwrap().insert(group, messages);
    }

    pub fn script_delete(&self, group: ChatId, id: MessageId, results: Vec<TransportResult<()>>) {
        self.deletes
            .lock()
            .unwrap()
            .entry((group, id))
            .or_default()
            .extend(results);
    }

    pub fn fail_listing(&self, group: ChatId, err: TransportError) {
        self.listing_errors.lock().unwrap().insert(group, err);
    }

    pub fn deleted(&self) -> Vec<(ChatId, MessageId, Instant)> {
        self.deleted.lock().unwrap().clone()
    }

    fn record(&self, target: ChatId, via: SentVia, msg: &OutboundMessage) -> TransportResult<()> {
        self.calls.lock().unwrap().push(Call {
            target,
            via,
            msg: msg.clone(),
            at: Instant::now(),
        });
        self.sends
            .lock()
            .unwrap()
            .get_mut(&target)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(()))
    }
}

pub fn forwarded(id: i32) -> HistoryMessage {
    HistoryMessage {
        message_id: MessageId(id),
        is_forward: true,
    }
}

pub fn original(id: i32) -> HistoryMessage {
    HistoryMessage {
        message_id: MessageId(id),
        is_forward: false,
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn forward(&self, target: ChatId, msg: &OutboundMessage) -> TransportResult<()> {
        self.record(target, SentVia::Forward, msg)
    }

    async fn send_topic(
        &self,
        target: ChatId,
        topic: TopicId,
        msg: &OutboundMessage,
    ) -> TransportResult<()> {
        self.record(target, SentVia::Topic(topic), msg)
    }

    async fn delete_message(&self, group: ChatId, message_id: MessageId) -> TransportResult<()> {
        let res = self
            .deletes
            .lock()
            .unwrap()
            .get_mut(&(group, message_id))
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(()));
        if res.is_ok() {
            self.deleted
                .lock()
                .unwrap()
                .push((group, message_id, Instant::now()));
        }
        res
    }

    async fn iter_messages(&self, group: ChatId) -> TransportResult<Box<dyn MessageIter>> {
        if let Some(err) = self.listing_errors.lock().unwrap().get(&group) {
            return Err(err.clone());
        }
        let messages = self
            .histories
            .lock()
            .unwrap()
            .get(&group)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(VecMessageIter::new(messages)))
    }
}
