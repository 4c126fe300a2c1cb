use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::{
    domain::ChatId,
    ledger::{EntryKind, HistoryEntry, HistoryLedger},
    Result,
};

/// Counts per (destination, kind). Always a fold over the ledger.
pub type Counts = BTreeMap<(ChatId, EntryKind), u64>;

/// Fold ledger entries into per-destination counts.
pub fn fold<'a>(entries: impl IntoIterator<Item = &'a HistoryEntry>) -> Counts {
    let mut out = Counts::new();
    for e in entries {
        *out.entry((e.target, e.kind)).or_insert(0) += 1;
    }
    out
}

/// Incrementally maintained view of `fold(ledger)`.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    counts: Mutex<Counts>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a HistoryEntry>) -> Self {
        Self {
            counts: Mutex::new(fold(entries)),
        }
    }

    /// Rebuild from the full durable ledger.
    pub fn from_ledger(ledger: &HistoryLedger) -> Result<Self> {
        let entries = ledger.replay()?;
        Ok(Self::from_entries(&entries))
    }

    /// Bump a counter and return its new value.
    pub async fn increment(&self, target: ChatId, kind: EntryKind) -> u64 {
        let mut counts = self.counts.lock().await;
        let c = counts.entry((target, kind)).or_insert(0);
        *c += 1;
        *c
    }

    pub async fn get(&self, target: ChatId, kind: EntryKind) -> u64 {
        self.counts
            .lock()
            .await
            .get(&(target, kind))
            .copied()
            .unwrap_or(0)
    }

    pub async fn total(&self, kind: EntryKind) -> u64 {
        self.counts
            .lock()
            .await
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, c)| *c)
            .sum()
    }

    pub async fn snapshot(&self) -> Counts {
        self.counts.lock().await.clone()
    }

    /// Replace the counters with a fresh fold of the durable ledger.
    pub async fn recompute(&self, ledger: &HistoryLedger) -> Result<()> {
        let fresh = fold(&ledger.replay()?);
        *self.counts.lock().await = fresh;
        Ok(())
    }
}
