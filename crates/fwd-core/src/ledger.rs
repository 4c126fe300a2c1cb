//! Append-only history of forwards and deletions.
//!
//! The durable record lives behind `LedgerStore`; `HistoryLedger` serializes
//! appends (one total order) and keeps an optionally bounded in-memory view for
//! display. Evicting from the view never touches the store.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{ChatId, MessageId, TopicId},
    errors::Error,
    routing::RuleId,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Forwarded,
    Deleted,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Forwarded => "forwarded",
            EntryKind::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub source: ChatId,
    pub target: ChatId,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<TopicId>,
}

/// Entry contents before the ledger assigns sequence number and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryDraft {
    pub kind: EntryKind,
    pub source: ChatId,
    pub target: ChatId,
    pub message_id: MessageId,
    pub rule: Option<RuleId>,
    pub topic: Option<TopicId>,
}

impl EntryDraft {
    pub fn forwarded(source: ChatId, target: ChatId, message_id: MessageId) -> Self {
        Self {
            kind: EntryKind::Forwarded,
            source,
            target,
            message_id,
            rule: None,
            topic: None,
        }
    }

    /// Deletions happen inside one group, which is both source and target.
    pub fn deleted(group: ChatId, message_id: MessageId) -> Self {
        Self {
            kind: EntryKind::Deleted,
            source: group,
            target: group,
            message_id,
            rule: None,
            topic: None,
        }
    }

    pub fn with_rule(mut self, rule: RuleId) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn with_topic(mut self, topic: Option<TopicId>) -> Self {
        self.topic = topic;
        self
    }
}

/// Selects entries by chat (source or target) and/or kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerQuery {
    pub chat: Option<ChatId>,
    pub kind: Option<EntryKind>,
}

impl LedgerQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn chat(mut self, chat: ChatId) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, e: &HistoryEntry) -> bool {
        if let Some(c) = self.chat {
            if e.source != c && e.target != c {
                return false;
            }
        }
        self.kind.map_or(true, |k| e.kind == k)
    }
}

/// Append-only durable log.
pub trait LedgerStore: Send + Sync {
    fn append(&self, entry: &HistoryEntry) -> Result<()>;

    /// Every entry ever appended, in append order.
    fn load(&self) -> Result<Vec<HistoryEntry>>;
}

/// One JSON object per line.
///
/// The file is opened once, on the first append. A final line without a
/// newline (left by a crash mid-write) is cut off at that point so the next
/// entry starts on a line of its own.
#[derive(Debug)]
pub struct JsonlLedgerStore {
    path: PathBuf,
    file: std::sync::Mutex<Option<File>>,
}

impl JsonlLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: std::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_for_append(&self) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.last().is_some_and(|&b| b != b'\n') {
            let keep = buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
            tracing::warn!(
                path = %self.path.display(),
                dropped = buf.len() - keep,
                "truncating torn ledger tail"
            );
            file.set_len(keep as u64)?;
        }
        Ok(file)
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Storage("ledger file lock poisoned".to_string()))?;
        if file.is_none() {
            *file = Some(self.open_for_append()?);
        }
        let Some(f) = file.as_mut() else {
            return Err(Error::Storage("ledger file not open".to_string()));
        };
        if let Err(e) = f.write_all(line.as_bytes()).and_then(|()| f.flush()) {
            // Reopen next time so a partial write is repaired first.
            *file = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<HistoryEntry>> {
        let txt = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for (idx, line) in txt.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(e) => out.push(e),
                // A torn final line after a crash is expected; skip it.
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    "skipping unreadable ledger line: {e}"
                ),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: std::sync::Mutex<Vec<HistoryEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory ledger poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| Error::Storage("memory ledger poisoned".to_string()))?
            .clone())
    }
}

#[derive(Debug)]
struct LedgerView {
    entries: VecDeque<HistoryEntry>,
    capacity: Option<usize>,
    next_seq: u64,
}

impl LedgerView {
    fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        if let Some(cap) = self.capacity {
            while self.entries.len() > cap {
                self.entries.pop_front();
            }
        }
    }
}

pub struct HistoryLedger {
    store: Arc<dyn LedgerStore>,
    view: Mutex<LedgerView>,
}

impl HistoryLedger {
    /// Empty ledger over `store`. `capacity` bounds the in-memory view only.
    pub fn new(store: Arc<dyn LedgerStore>, capacity: Option<usize>) -> Self {
        Self {
            store,
            view: Mutex::new(LedgerView {
                entries: VecDeque::new(),
                capacity,
                next_seq: 1,
            }),
        }
    }

    /// Open over an existing store, seeding the view from its tail.
    pub fn open(store: Arc<dyn LedgerStore>, capacity: Option<usize>) -> Result<Self> {
        let existing = store.load()?;
        let next_seq = existing.iter().map(|e| e.seq).max().unwrap_or(0) + 1;

        let mut view = LedgerView {
            entries: VecDeque::new(),
            capacity,
            next_seq,
        };
        let skip = capacity.map_or(0, |c| existing.len().saturating_sub(c));
        for e in existing.into_iter().skip(skip) {
            view.push(e);
        }

        Ok(Self {
            store,
            view: Mutex::new(view),
        })
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()), None)
    }

    /// Durably append an entry. A storage failure is returned and the entry is
    /// not added to the view.
    pub async fn append(&self, draft: EntryDraft) -> Result<HistoryEntry> {
        let mut view = self.view.lock().await;
        let entry = HistoryEntry {
            seq: view.next_seq,
            source: draft.source,
            target: draft.target,
            message_id: draft.message_id,
            timestamp: Utc::now(),
            kind: draft.kind,
            rule: draft.rule,
            topic: draft.topic,
        };
        self.store.append(&entry)?;
        view.next_seq += 1;
        view.push(entry.clone());
        Ok(entry)
    }

    /// Matching entries from the in-memory view, in insertion order.
    pub async fn query(&self, q: LedgerQuery) -> Vec<HistoryEntry> {
        let view = self.view.lock().await;
        view.entries.iter().filter(|e| q.matches(e)).cloned().collect()
    }

    /// The newest `n` matching entries, oldest first.
    pub async fn recent(&self, q: LedgerQuery, n: usize) -> Vec<HistoryEntry> {
        let mut out = self.query(q).await;
        let skip = out.len().saturating_sub(n);
        out.drain(..skip);
        out
    }

    pub async fn len(&self) -> usize {
        self.view.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The full durable ledger (not limited by the view capacity).
    pub fn replay(&self) -> Result<Vec<HistoryEntry>> {
        self.store.load()
    }
}
