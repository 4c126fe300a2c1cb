//! Bounded per-chat index of messages the bot has seen or sent.
//!
//! The Bot API has no "list chat history" call, so deletion sweeps walk this
//! index instead.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use fwd_core::domain::{ChatId, HistoryMessage, MessageId};

#[derive(Debug)]
pub struct SeenIndex {
    per_chat: usize,
    chats: Mutex<HashMap<ChatId, VecDeque<HistoryMessage>>>,
}

impl SeenIndex {
    pub fn new(per_chat: usize) -> Self {
        Self {
            per_chat: per_chat.max(1),
            chats: Mutex::new(HashMap::new()),
        }
    }

    fn chats(&self) -> MutexGuard<'_, HashMap<ChatId, VecDeque<HistoryMessage>>> {
        // The map stays consistent even if a holder panicked.
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remember a message; the oldest entry for the chat is evicted when full.
    pub fn record(&self, chat: ChatId, msg: HistoryMessage) {
        let mut chats = self.chats();
        let q = chats.entry(chat).or_default();
        if let Some(existing) = q.iter_mut().find(|m| m.message_id == msg.message_id) {
            *existing = msg;
            return;
        }
        q.push_back(msg);
        while q.len() > self.per_chat {
            q.pop_front();
        }
    }

    pub fn forget(&self, chat: ChatId, id: MessageId) {
        if let Some(q) = self.chats().get_mut(&chat) {
            q.retain(|m| m.message_id != id);
        }
    }

    /// Newest first.
    pub fn snapshot(&self, chat: ChatId) -> Vec<HistoryMessage> {
        self.chats()
            .get(&chat)
            .map(|q| q.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, chat: ChatId) -> usize {
        self.chats().get(&chat).map_or(0, |q| q.len())
    }
}
