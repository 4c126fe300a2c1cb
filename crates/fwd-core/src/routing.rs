//! Routing table: which rules fire for which source chat.
//!
//! Rules are sharded by source chat. Registration and status changes take the
//! write half of one shard only, so unrelated sources never contend. Rules are
//! immutable once stored; a status change swaps in a new `Arc<ForwardingRule>`.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, TopicId},
    errors::Error,
    filter::Filter,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a route: source plus the ordered set of target chats.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub source: ChatId,
    pub targets: Vec<ChatId>,
}

impl RouteKey {
    pub fn new(source: ChatId, targets: impl IntoIterator<Item = ChatId>) -> Self {
        let mut targets: Vec<ChatId> = targets.into_iter().collect();
        targets.sort();
        targets.dedup();
        Self { source, targets }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets = self
            .targets
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{} -> [{}]", self.source, targets)
    }
}

/// One destination of a rule, optionally scoped to a forum topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub chat: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<TopicId>,
}

impl Target {
    pub fn chat(chat: ChatId) -> Self {
        Self { chat, topic: None }
    }

    pub fn topic(chat: ChatId, topic: TopicId) -> Self {
        Self {
            chat,
            topic: Some(topic),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.topic {
            Some(t) => write!(f, "{}:{}", self.chat, t),
            None => write!(f, "{}", self.chat),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Paused,
    Removed,
}

/// A user's request to forward a source to some targets.
#[derive(Clone, Debug)]
pub struct RuleSpec {
    pub source: ChatId,
    pub targets: Vec<Target>,
    pub filter: Filter,
    pub delay: Duration,
}

impl RuleSpec {
    pub fn new(source: ChatId, targets: Vec<Target>) -> Self {
        Self {
            source,
            targets,
            filter: Filter::default(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(self.source, self.targets.iter().map(|t| t.chat))
    }

    /// Reject rules that could never be dispatched correctly.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::InvalidRule("target list is empty".to_string()));
        }
        if self.targets.iter().any(|t| t.chat == self.source) {
            return Err(Error::InvalidRule(format!(
                "source {} cannot also be a target",
                self.source
            )));
        }
        if self.route_key().targets.len() != self.targets.len() {
            return Err(Error::InvalidRule(
                "each target chat may appear only once".to_string(),
            ));
        }
        if self.filter.keywords.iter().any(|k| k.is_empty()) {
            return Err(Error::InvalidRule("empty keyword".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub key: RouteKey,
    pub targets: Vec<Target>,
    pub filter: Filter,
    pub delay: Duration,
    pub status: RuleStatus,
}

impl ForwardingRule {
    pub fn handle(&self) -> RuleHandle {
        RuleHandle {
            id: self.id,
            source: self.key.source,
        }
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            source: self.key.source,
            targets: self.targets.clone(),
            filter: self.filter.clone(),
            delay: self.delay,
        }
    }

    fn with_status(&self, status: RuleStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Returned by `register`; identifies a rule and its shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleHandle {
    pub id: RuleId,
    pub source: ChatId,
}

/// An active rule as seen by the dispatcher.
///
/// `cancel` fires when the rule is paused or removed; lanes stop taking new
/// deliveries for it.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub rule: Arc<ForwardingRule>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct RuleSlot {
    rule: Arc<ForwardingRule>,
    cancel: CancellationToken,
}

/// Live rules for one source, plus the ids of rules removed from it.
///
/// Removed rules leave `slots`; only their id is kept so repeated removals
/// stay idempotent.
#[derive(Debug, Default)]
struct ShardState {
    slots: Vec<RuleSlot>,
    removed: HashSet<RuleId>,
}

impl ShardState {
    fn index_of(&self, id: RuleId) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.rule.id == id) {
            return Ok(idx);
        }
        if self.removed.contains(&id) {
            return Err(Error::InvalidRule(format!("rule {id} was removed")));
        }
        Err(Error::UnknownRule(id.0))
    }

    fn push(&mut self, rule: ForwardingRule) -> RuleHandle {
        let handle = rule.handle();
        let cancel = CancellationToken::new();
        if rule.status != RuleStatus::Active {
            cancel.cancel();
        }
        self.slots.push(RuleSlot {
            rule: Arc::new(rule),
            cancel,
        });
        handle
    }

    fn retire(&mut self, idx: usize) {
        let slot = self.slots.remove(idx);
        slot.cancel.cancel();
        self.removed.insert(slot.rule.id);
    }
}

type Shard = Arc<RwLock<ShardState>>;

#[derive(Debug)]
pub struct RoutingTable {
    next_id: AtomicU64,
    shards: RwLock<HashMap<ChatId, Shard>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// First id not yet handed out.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Never hand out an id below `next`.
    pub fn reserve_ids(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::SeqCst);
    }

    async fn shard(&self, source: ChatId) -> Shard {
        if let Some(s) = self.shards.read().await.get(&source) {
            return s.clone();
        }
        let mut map = self.shards.write().await;
        map.entry(source).or_default().clone()
    }

    async fn existing_shard(&self, source: ChatId) -> Option<Shard> {
        self.shards.read().await.get(&source).cloned()
    }

    async fn all_shards(&self) -> Vec<Shard> {
        self.shards.read().await.values().cloned().collect()
    }

    fn new_rule(&self, spec: RuleSpec, key: RouteKey, status: RuleStatus) -> ForwardingRule {
        ForwardingRule {
            id: RuleId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            key,
            targets: spec.targets,
            filter: spec.filter,
            delay: spec.delay,
            status,
        }
    }

    /// Store a new active rule, unless an active rule already owns its key.
    pub async fn register(&self, spec: RuleSpec) -> Result<RuleHandle> {
        spec.validate()?;
        let key = spec.route_key();
        let shard = self.shard(spec.source).await;
        let mut state = shard.write().await;

        ensure_unique(&state.slots, &key, None)?;
        Ok(state.push(self.new_rule(spec, key, RuleStatus::Active)))
    }

    /// Re-insert a persisted rule with its original id and status.
    pub async fn restore(&self, rule: ForwardingRule) -> Result<RuleHandle> {
        rule.spec().validate()?;
        let shard = self.shard(rule.key.source).await;
        let mut state = shard.write().await;

        if state.slots.iter().any(|s| s.rule.id == rule.id) || state.removed.contains(&rule.id) {
            return Err(Error::InvalidRule(format!("rule {} already loaded", rule.id)));
        }
        self.next_id.fetch_max(rule.id.0 + 1, Ordering::SeqCst);
        if rule.status == RuleStatus::Removed {
            state.removed.insert(rule.id);
            return Ok(rule.handle());
        }
        if rule.status == RuleStatus::Active {
            ensure_unique(&state.slots, &rule.key, None)?;
        }
        Ok(state.push(rule))
    }

    /// Mark a rule removed. Returns `false` if it already was.
    pub async fn unregister(&self, handle: RuleHandle) -> Result<bool> {
        let prev = self.set_status(handle, RuleStatus::Removed).await?;
        Ok(prev != RuleStatus::Removed)
    }

    /// Change a rule's status and return the previous one.
    ///
    /// Removed is terminal. Re-activating fails if another active rule has
    /// taken the same key in the meantime.
    pub async fn set_status(&self, handle: RuleHandle, status: RuleStatus) -> Result<RuleStatus> {
        let shard = self
            .existing_shard(handle.source)
            .await
            .ok_or(Error::UnknownRule(handle.id.0))?;
        let mut state = shard.write().await;

        if status == RuleStatus::Removed && state.removed.contains(&handle.id) {
            return Ok(RuleStatus::Removed);
        }
        let idx = state.index_of(handle.id)?;

        let prev = state.slots[idx].rule.status;
        if prev == status {
            return Ok(prev);
        }
        if status == RuleStatus::Active {
            ensure_unique(&state.slots, &state.slots[idx].rule.key, Some(handle.id))?;
        }

        match status {
            RuleStatus::Removed => state.retire(idx),
            RuleStatus::Active | RuleStatus::Paused => {
                let slot = &mut state.slots[idx];
                slot.rule = Arc::new(slot.rule.with_status(status));
                if status == RuleStatus::Active {
                    slot.cancel = CancellationToken::new();
                } else {
                    slot.cancel.cancel();
                }
            }
        }
        Ok(prev)
    }

    /// Swap a live rule for `spec` under a new id, keeping its status.
    ///
    /// Both shards stay write-locked for the whole swap, so no registration
    /// can slip in between retiring the old rule and storing the new one.
    pub async fn replace(&self, handle: RuleHandle, spec: RuleSpec) -> Result<RuleHandle> {
        spec.validate()?;
        let old_shard = self
            .existing_shard(handle.source)
            .await
            .ok_or(Error::UnknownRule(handle.id.0))?;

        if spec.source == handle.source {
            let mut state = old_shard.write().await;
            return self.swap(&mut *state, None, handle, spec);
        }

        let new_shard = self.shard(spec.source).await;
        // Lock in source order so two crossing replaces cannot deadlock.
        let (mut old, mut new) = if handle.source < spec.source {
            let old = old_shard.write().await;
            (old, new_shard.write().await)
        } else {
            let new = new_shard.write().await;
            (old_shard.write().await, new)
        };
        self.swap(&mut *old, Some(&mut *new), handle, spec)
    }

    fn swap(
        &self,
        old: &mut ShardState,
        new: Option<&mut ShardState>,
        handle: RuleHandle,
        spec: RuleSpec,
    ) -> Result<RuleHandle> {
        let idx = old.index_of(handle.id)?;
        let status = old.slots[idx].rule.status;
        let key = spec.route_key();
        if status == RuleStatus::Active {
            let dest = match &new {
                Some(n) => &n.slots,
                None => &old.slots,
            };
            ensure_unique(dest, &key, Some(handle.id))?;
        }

        let rule = self.new_rule(spec, key, status);
        old.retire(idx);
        let dest = match new {
            Some(n) => n,
            None => old,
        };
        Ok(dest.push(rule))
    }

    /// All active rules for `source`, in registration order.
    pub async fn lookup(&self, source: ChatId) -> Vec<RouteMatch> {
        let Some(shard) = self.existing_shard(source).await else {
            return Vec::new();
        };
        let state = shard.read().await;
        state
            .slots
            .iter()
            .filter(|s| s.rule.status == RuleStatus::Active)
            .map(|s| RouteMatch {
                rule: s.rule.clone(),
                cancel: s.cancel.clone(),
            })
            .collect()
    }

    /// A rule that has not been removed.
    pub async fn get(&self, id: RuleId) -> Option<Arc<ForwardingRule>> {
        for shard in self.all_shards().await {
            if let Some(s) = shard.read().await.slots.iter().find(|s| s.rule.id == id) {
                return Some(s.rule.clone());
            }
        }
        None
    }

    /// Handle for any rule this table has seen, removed ones included.
    pub async fn handle(&self, id: RuleId) -> Option<RuleHandle> {
        for (source, shard) in self.shards.read().await.iter() {
            let state = shard.read().await;
            if state.removed.contains(&id) || state.slots.iter().any(|s| s.rule.id == id) {
                return Some(RuleHandle { id, source: *source });
            }
        }
        None
    }

    /// Every rule that is not removed, ordered by id.
    pub async fn rules(&self) -> Vec<Arc<ForwardingRule>> {
        let mut out = Vec::new();
        for shard in self.all_shards().await {
            out.extend(shard.read().await.slots.iter().map(|s| s.rule.clone()));
        }
        out.sort_by_key(|r| r.id);
        out
    }
}

fn ensure_unique(slots: &[RuleSlot], key: &RouteKey, except: Option<RuleId>) -> Result<()> {
    let clash = slots.iter().any(|s| {
        s.rule.status == RuleStatus::Active && &s.rule.key == key && Some(s.rule.id) != except
    });
    if clash {
        return Err(Error::DuplicateRule {
            key: key.to_string(),
        });
    }
    Ok(())
}
