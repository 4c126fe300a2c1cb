//! The dispatcher.
//!
//! Every inbound message is matched against the routing table and fanned out to
//! one lane per (rule, target). A lane is a tokio task with its own queue; it
//! only ever waits on its own destination's cooldown, its own transport call or
//! its own pacing delay, so a flooded destination never holds up another one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{ChatId, InboundMessage, OutboundMessage},
    errors::{Error, TransportError},
    ledger::{EntryDraft, EntryKind, HistoryLedger},
    ports::{PresentationSink, Transport, TransportResult},
    rate_limit::RateLimiter,
    routing::{ForwardingRule, RouteMatch, RoutingTable, RuleHandle, RuleId, RuleSpec, RuleStatus, Target},
    stats::StatisticsAggregator,
    store::StateDir,
    transform::{apply_chain, ChainOutcome, MessageTransformer},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct LaneKey {
    rule: RuleId,
    target: ChatId,
}

#[derive(Clone, Debug)]
struct Delivery {
    source: ChatId,
    msg: OutboundMessage,
}

struct Lane {
    tx: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
}

/// What `dispatch` did with one inbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Active rules for the source.
    pub rules: usize,
    /// Rules whose filter rejected the message.
    pub filtered: usize,
    /// Deliveries queued onto lanes.
    pub queued: usize,
    /// A transformer dropped the message.
    pub dropped: bool,
}

pub(crate) struct EngineInner {
    pub(crate) routes: Arc<RoutingTable>,
    pub(crate) limiter: RateLimiter,
    pub(crate) ledger: Arc<HistoryLedger>,
    pub(crate) stats: Arc<StatisticsAggregator>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) sink: Arc<dyn PresentationSink>,
    transformers: Vec<Arc<dyn MessageTransformer>>,
    state: Option<Arc<StateDir>>,
    lanes: Mutex<HashMap<LaneKey, Lane>>,
    shutdown: CancellationToken,
    failure: std::sync::Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct ForwardingEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl ForwardingEngine {
    pub fn new(
        routes: Arc<RoutingTable>,
        ledger: Arc<HistoryLedger>,
        stats: Arc<StatisticsAggregator>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self::build(routes, ledger, stats, transport, sink, Vec::new(), None)
    }

    fn build(
        routes: Arc<RoutingTable>,
        ledger: Arc<HistoryLedger>,
        stats: Arc<StatisticsAggregator>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PresentationSink>,
        transformers: Vec<Arc<dyn MessageTransformer>>,
        state: Option<Arc<StateDir>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                routes,
                limiter: RateLimiter::new(),
                ledger,
                stats,
                transport,
                sink,
                transformers,
                state,
                lanes: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                failure: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Rebuild an engine from a state directory: rules, rate limits and the
    /// ledger (statistics are re-folded from it).
    pub async fn restore(
        state: Arc<StateDir>,
        view_limit: usize,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PresentationSink>,
        transformers: Vec<Arc<dyn MessageTransformer>>,
    ) -> Result<Self> {
        let ledger = Arc::new(HistoryLedger::open(
            Arc::new(state.ledger_store()),
            Some(view_limit),
        )?);
        let stats = Arc::new(StatisticsAggregator::from_ledger(&ledger)?);

        let routes = Arc::new(RoutingTable::new());
        let saved = state.load_rules()?;
        routes.reserve_ids(saved.next_id);
        for rule in saved.rules {
            let id = rule.id;
            if let Err(e) = routes.restore(rule).await {
                warn!(rule = %id, "skipping persisted rule: {e}");
            }
        }

        let engine = Self::build(
            routes,
            ledger,
            stats,
            transport,
            sink,
            transformers,
            Some(state.clone()),
        );
        engine
            .inner
            .limiter
            .restore(state.load_rate_limits()?)
            .await;

        info!(
            rules = engine.inner.routes.rules().await.len(),
            history = engine.inner.ledger.len().await,
            "engine state restored from {}",
            state.root().display()
        );
        Ok(engine)
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.inner.routes
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn ledger(&self) -> &HistoryLedger {
        &self.inner.ledger
    }

    pub fn stats(&self) -> &StatisticsAggregator {
        &self.inner.stats
    }

    // ============== Rule management ==============

    pub async fn register(&self, spec: RuleSpec) -> Result<RuleHandle> {
        let key = spec.route_key();
        let handle = self.inner.routes.register(spec).await?;
        info!(rule = %handle.id, route = %key, "rule registered");
        self.inner
            .log(format!("Forwarding rule {} active: {key}", handle.id));
        self.inner.save_rules().await?;
        Ok(handle)
    }

    /// Remove a rule. Queued deliveries for it are dropped; in-flight ones finish.
    pub async fn unregister(&self, id: RuleId) -> Result<bool> {
        let handle = self.handle(id).await?;
        let changed = self.inner.routes.unregister(handle).await?;
        self.inner.drop_lanes(id).await;
        if changed {
            info!(rule = %id, "rule removed");
            self.inner.log(format!("Forwarding rule {id} removed"));
            self.inner.save_rules().await?;
        }
        Ok(changed)
    }

    pub async fn pause(&self, id: RuleId) -> Result<()> {
        let handle = self.handle(id).await?;
        self.inner
            .routes
            .set_status(handle, RuleStatus::Paused)
            .await?;
        self.inner.drop_lanes(id).await;
        info!(rule = %id, "rule paused");
        self.inner.log(format!("Forwarding rule {id} paused"));
        self.inner.save_rules().await
    }

    pub async fn resume(&self, id: RuleId) -> Result<()> {
        let handle = self.handle(id).await?;
        self.inner
            .routes
            .set_status(handle, RuleStatus::Active)
            .await?;
        info!(rule = %id, "rule resumed");
        self.inner.log(format!("Forwarding rule {id} resumed"));
        self.inner.save_rules().await
    }

    /// Replace a live rule with an edited copy under a new id. A paused rule
    /// stays paused; a removed one cannot be replaced.
    pub async fn replace(&self, id: RuleId, spec: RuleSpec) -> Result<RuleHandle> {
        let old = self.handle(id).await?;
        let key = spec.route_key();
        let new = self.inner.routes.replace(old, spec).await?;
        self.inner.drop_lanes(id).await;
        info!(rule = %new.id, replaces = %id, route = %key, "rule replaced");
        self.inner
            .log(format!("Forwarding rule {id} replaced by {}: {key}", new.id));
        self.inner.save_rules().await?;
        Ok(new)
    }

    async fn handle(&self, id: RuleId) -> Result<RuleHandle> {
        self.inner
            .routes
            .handle(id)
            .await
            .ok_or(Error::UnknownRule(id.0))
    }

    // ============== Dispatch ==============

    /// Fan one inbound message out to every matching lane without waiting for
    /// any delivery.
    pub async fn dispatch(&self, msg: InboundMessage) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        if self.inner.shutdown.is_cancelled() {
            return summary;
        }

        let routes = self.inner.routes.lookup(msg.source).await;
        summary.rules = routes.len();
        if routes.is_empty() {
            return summary;
        }

        let matched: Vec<RouteMatch> = routes
            .into_iter()
            .filter(|m| {
                let ok = m.rule.filter.matches(&msg.text, msg.sender);
                if !ok {
                    debug!(rule = %m.rule.id, msg_id = %msg.message_id, "filtered out");
                }
                ok
            })
            .collect();
        summary.filtered = summary.rules - matched.len();
        if matched.is_empty() {
            return summary;
        }

        let text = match apply_chain(&self.inner.transformers, &msg).await {
            ChainOutcome::Forward { text } => text,
            ChainOutcome::Dropped { by, reason } => {
                info!(msg_id = %msg.message_id, source = %msg.source, transformer = %by, "message dropped: {reason}");
                self.inner.log(format!(
                    "Message {} from {} dropped by {by}: {reason}",
                    msg.message_id, msg.source
                ));
                summary.dropped = true;
                return summary;
            }
        };

        let delivery = Delivery {
            source: msg.source,
            msg: OutboundMessage {
                origin: msg.message_ref(),
                text,
            },
        };

        for m in &matched {
            for target in &m.rule.targets {
                self.inner
                    .enqueue(m, *target, delivery.clone())
                    .await;
                summary.queued += 1;
            }
        }
        summary
    }

    /// Consume an event feed until it closes or the engine shuts down.
    pub async fn run(&self, mut events: mpsc::Receiver<InboundMessage>) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(msg) => {
                        self.dispatch(msg).await;
                    }
                    None => break,
                },
            }
        }
        self.finish().await
    }

    /// Stop accepting work. Lanes exit after their current delivery.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolves once the engine is shut down (explicitly or by a fatal error).
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// The fatal storage error that stopped the engine, if any.
    pub fn failure(&self) -> Option<String> {
        self.inner
            .failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
    }

    /// Persist the rate-limit table and report any fatal failure.
    pub async fn finish(&self) -> Result<()> {
        self.inner.save_rate_limits().await;
        match self.failure() {
            Some(reason) => Err(Error::Storage(reason)),
            None => Ok(()),
        }
    }
}

impl EngineInner {
    pub(crate) fn log(&self, line: String) {
        self.sink.on_log(line);
    }

    /// Latch a fatal condition and stop the engine.
    pub(crate) fn fail(&self, err: Error) {
        error!("fatal: {err}");
        if let Ok(mut f) = self.failure.lock() {
            if f.is_none() {
                *f = Some(err.to_string());
            }
        }
        self.log(format!("Fatal: {err}"));
        self.shutdown.cancel();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn save_rules(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let rules: Vec<ForwardingRule> = self
            .routes
            .rules()
            .await
            .iter()
            .map(|r| r.as_ref().clone())
            .collect();
        state.save_rules(&rules, self.routes.next_id())
    }

    pub(crate) async fn save_rate_limits(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let snap = self.limiter.snapshot().await;
        if let Err(e) = state.save_rate_limits(&snap) {
            warn!("failed to persist rate limits: {e}");
        }
    }

    async fn drop_lanes(&self, rule: RuleId) {
        self.lanes.lock().await.retain(|k, _| k.rule != rule);
    }

    async fn enqueue(self: &Arc<Self>, m: &RouteMatch, target: Target, delivery: Delivery) {
        let key = LaneKey {
            rule: m.rule.id,
            target: target.chat,
        };
        let mut lanes = self.lanes.lock().await;

        let delivery = match lanes.get(&key) {
            Some(lane) if !lane.cancel.is_cancelled() => match lane.tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(d)) => d,
            },
            _ => delivery,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the spawned lane exits.
        let _ = tx.send(delivery);
        tokio::spawn(run_lane(
            self.clone(),
            m.rule.clone(),
            target,
            m.cancel.clone(),
            rx,
        ));
        lanes.insert(
            key,
            Lane {
                tx,
                cancel: m.cancel.clone(),
            },
        );
    }

    async fn send(&self, target: Target, msg: &OutboundMessage) -> TransportResult<()> {
        match target.topic {
            Some(topic) => self.transport.send_topic(target.chat, topic, msg).await,
            None => self.transport.forward(target.chat, msg).await,
        }
    }

    /// Wait for the destination's cooldown. `false` if the rule went away first.
    pub(crate) async fn wait_turn(&self, dest: ChatId, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
            _ = self.limiter.wait_if_needed(dest) => true,
        }
    }

    /// One delivery attempt with a single retry after a flood wait.
    async fn deliver(&self, rule: &ForwardingRule, target: Target, d: &Delivery, cancel: &CancellationToken) {
        if !self.wait_turn(target.chat, cancel).await {
            return;
        }

        let first = self.send(target, &d.msg).await;
        let result = match first {
            Err(TransportError::FloodWait(wait)) => {
                info!(rule = %rule.id, dest = %target, "flood wait {:?}; retrying once", wait);
                self.log(format!(
                    "Flood wait on {target}: retrying in {}s",
                    wait.as_secs_f64().ceil()
                ));
                self.limiter.report_flood_wait(target.chat, wait).await;
                self.save_rate_limits().await;
                if !self.wait_turn(target.chat, cancel).await {
                    return;
                }
                self.send(target, &d.msg).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.limiter.report_success(target.chat).await;
                self.record_forward(rule, target, d).await;
            }
            Err(e) => {
                if let Some(wait) = e.retry_after() {
                    self.limiter.report_flood_wait(target.chat, wait).await;
                    self.save_rate_limits().await;
                }
                error!(rule = %rule.id, dest = %target, msg_id = %d.msg.origin.message_id, "delivery failed: {e}");
                self.log(format!(
                    "Error forwarding message {} to {target}: {e}",
                    d.msg.origin.message_id
                ));
            }
        }
    }

    async fn record_forward(&self, rule: &ForwardingRule, target: Target, d: &Delivery) {
        let draft = EntryDraft::forwarded(d.source, target.chat, d.msg.origin.message_id)
            .with_rule(rule.id)
            .with_topic(target.topic);
        let entry = match self.ledger.append(draft).await {
            Ok(e) => e,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let count = self.stats.increment(target.chat, EntryKind::Forwarded).await;

        debug!(rule = %rule.id, dest = %target, seq = entry.seq, "forwarded");
        self.sink.on_history_updated(&entry);
        self.sink
            .on_stats_updated(target.chat, EntryKind::Forwarded, count);
        self.log(format!(
            "Message {} forwarded from {} to {target}",
            entry.message_id, entry.source
        ));
    }
}

async fn run_lane(
    inner: Arc<EngineInner>,
    rule: Arc<ForwardingRule>,
    target: Target,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    debug!(rule = %rule.id, dest = %target, "lane started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = inner.shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(j) => j,
                None => break,
            },
        };

        inner.deliver(&rule, target, &job, &cancel).await;

        if rule.delay > Duration::ZERO {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(rule.delay) => {}
            }
        }
    }
    debug!(rule = %rule.id, dest = %target, "lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MessageId, TopicId, UserId},
        filter::Filter,
        ledger::{HistoryEntry, LedgerQuery, LedgerStore},
        ports::{ChannelSink, NullSink, SinkEvent},
        testkit::{FakeTransport, SentVia},
        transform::Transform,
    };
    use tokio::time::Instant;

    struct Harness {
        engine: ForwardingEngine,
        transport: Arc<FakeTransport>,
        events: mpsc::Receiver<SinkEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_ledger(HistoryLedger::in_memory())
        }

        fn with_ledger(ledger: HistoryLedger) -> Self {
            let transport = Arc::new(FakeTransport::default());
            let (sink, events) = ChannelSink::new(1024);
            let engine = ForwardingEngine::new(
                Arc::new(RoutingTable::new()),
                Arc::new(ledger),
                Arc::new(StatisticsAggregator::new()),
                transport.clone(),
                Arc::new(sink),
            );
            Self {
                engine,
                transport,
                events,
            }
        }

        async fn next_history(&mut self) -> HistoryEntry {
            loop {
                match self.events.recv().await {
                    Some(SinkEvent::History(e)) => return e,
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        }
    }

    fn targets(ids: &[i64]) -> Vec<Target> {
        ids.iter().map(|&t| Target::chat(ChatId(t))).collect()
    }

    fn inbound(source: i64, id: i32, sender: i64, text: &str) -> InboundMessage {
        InboundMessage {
            source: ChatId(source),
            sender: Some(UserId(sender)),
            message_id: MessageId(id),
            text: text.to_string(),
            media: None,
        }
    }

    #[tokio::test]
    async fn fan_out_writes_one_entry_per_target() {
        let mut h = Harness::new();
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10, 20, 30])))
            .await
            .unwrap();

        let s = h.engine.dispatch(inbound(1, 5, 99, "hello")).await;
        assert_eq!(s.queued, 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(h.next_history().await.target);
        }
        seen.sort();
        assert_eq!(seen, vec![ChatId(10), ChatId(20), ChatId(30)]);

        assert_eq!(h.engine.ledger().len().await, 3);
        for t in [10, 20, 30] {
            assert_eq!(h.engine.stats().get(ChatId(t), EntryKind::Forwarded).await, 1);
        }
        assert_eq!(h.engine.stats().total(EntryKind::Forwarded).await, 3);
    }

    #[tokio::test]
    async fn unknown_source_is_a_no_op() {
        let h = Harness::new();
        let s = h.engine.dispatch(inbound(1, 5, 99, "hello")).await;
        assert_eq!(s, DispatchSummary::default());
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn filter_rejection_queues_nothing() {
        let h = Harness::new();
        let filter = Filter {
            keywords: vec!["signal".to_string()],
            ..Filter::default()
        };
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])).with_filter(filter))
            .await
            .unwrap();

        let s = h.engine.dispatch(inbound(1, 5, 99, "noise")).await;
        assert_eq!(s.rules, 1);
        assert_eq!(s.filtered, 1);
        assert_eq!(s.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_target_does_not_delay_healthy_target() {
        let mut h = Harness::new();
        h.transport
            .script(ChatId(10), vec![Err(TransportError::FloodWait(Duration::from_secs(30)))]);
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10, 20])))
            .await
            .unwrap();

        let start = Instant::now();
        h.engine.dispatch(inbound(1, 5, 99, "hello")).await;

        let first = h.next_history().await;
        assert_eq!(first.target, ChatId(20));
        assert!(start.elapsed() < Duration::from_secs(1));

        let second = h.next_history().await;
        assert_eq!(second.target, ChatId(10));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.transport.calls_to(ChatId(10)).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_flood_wait_abandons_attempt_but_keeps_rule() {
        let h = Harness::new();
        h.transport.script(
            ChatId(10),
            vec![
                Err(TransportError::FloodWait(Duration::from_secs(5))),
                Err(TransportError::FloodWait(Duration::from_secs(5))),
            ],
        );
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();

        h.engine.dispatch(inbound(1, 5, 99, "a")).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.calls_to(ChatId(10)).len(), 2);
        assert!(h.engine.ledger().is_empty().await);

        h.engine.dispatch(inbound(1, 6, 99, "b")).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.engine.ledger().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_abandons_only_that_delivery() {
        let h = Harness::new();
        h.transport.script(
            ChatId(10),
            vec![Err(TransportError::Forbidden("bot was kicked".to_string()))],
        );
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10, 20])))
            .await
            .unwrap();

        h.engine.dispatch(inbound(1, 5, 99, "a")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.calls_to(ChatId(10)).len(), 1);
        let entries = h.engine.ledger().query(LedgerQuery::all()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, ChatId(20));

        h.engine.dispatch(inbound(1, 6, 99, "b")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.engine
                .ledger()
                .query(LedgerQuery::all().chat(ChatId(10)))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn topic_targets_use_topic_send() {
        let mut h = Harness::new();
        h.engine
            .register(RuleSpec::new(
                ChatId(1),
                vec![Target::topic(ChatId(10), TopicId(3)), Target::chat(ChatId(20))],
            ))
            .await
            .unwrap();
        h.engine.dispatch(inbound(1, 5, 99, "a")).await;
        h.next_history().await;
        h.next_history().await;

        assert_eq!(h.transport.calls_to(ChatId(10))[0].via, SentVia::Topic(TopicId(3)));
        assert_eq!(h.transport.calls_to(ChatId(20))[0].via, SentVia::Forward);

        let e = h
            .engine
            .ledger()
            .query(LedgerQuery::all().chat(ChatId(10)))
            .await;
        assert_eq!(e[0].topic, Some(TopicId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn inter_message_delay_paces_each_lane() {
        let mut h = Harness::new();
        h.engine
            .register(
                RuleSpec::new(ChatId(1), targets(&[10])).with_delay(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        h.engine.dispatch(inbound(1, 1, 99, "a")).await;
        h.engine.dispatch(inbound(1, 2, 99, "b")).await;
        h.next_history().await;
        h.next_history().await;

        let calls = h.transport.calls_to(ChatId(10));
        assert_eq!(calls.len(), 2);
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_stops_queued_deliveries() {
        let mut h = Harness::new();
        let handle = h
            .engine
            .register(
                RuleSpec::new(ChatId(1), targets(&[10])).with_delay(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        h.engine.dispatch(inbound(1, 1, 99, "a")).await;
        h.engine.dispatch(inbound(1, 2, 99, "b")).await;
        h.next_history().await;

        assert!(h.engine.unregister(handle.id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.calls_to(ChatId(10)).len(), 1);

        let s = h.engine.dispatch(inbound(1, 3, 99, "c")).await;
        assert_eq!(s.rules, 0);
    }

    #[tokio::test]
    async fn paused_rule_resumes_with_fresh_lanes() {
        let mut h = Harness::new();
        let handle = h
            .engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();

        h.engine.pause(handle.id).await.unwrap();
        assert_eq!(h.engine.dispatch(inbound(1, 1, 99, "a")).await.rules, 0);

        h.engine.resume(handle.id).await.unwrap();
        h.engine.dispatch(inbound(1, 2, 99, "b")).await;
        let e = h.next_history().await;
        assert_eq!(e.message_id, MessageId(2));
    }

    #[tokio::test]
    async fn ledger_failure_stops_the_engine() {
        struct Full;
        impl LedgerStore for Full {
            fn append(&self, _e: &HistoryEntry) -> Result<()> {
                Err(Error::Storage("no space left on device".to_string()))
            }
            fn load(&self) -> Result<Vec<HistoryEntry>> {
                Ok(Vec::new())
            }
        }

        let h = Harness::with_ledger(HistoryLedger::new(Arc::new(Full), None));
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();
        h.engine.dispatch(inbound(1, 1, 99, "a")).await;

        h.engine.closed().await;
        assert!(h.engine.failure().unwrap().contains("no space"));
        assert!(matches!(h.engine.finish().await, Err(Error::Storage(_))));
        assert_eq!(
            h.engine.dispatch(inbound(1, 2, 99, "b")).await,
            DispatchSummary::default()
        );
    }

    #[tokio::test]
    async fn rewritten_text_reaches_transport() {
        struct Tag;
        #[async_trait::async_trait]
        impl MessageTransformer for Tag {
            fn name(&self) -> &str {
                "tag"
            }
            async fn transform(&self, msg: &InboundMessage) -> Transform {
                Transform::Rewrite(format!("[fwd] {}", msg.text))
            }
        }

        let transport = Arc::new(FakeTransport::default());
        let (sink, mut events) = ChannelSink::new(64);
        let engine = ForwardingEngine::build(
            Arc::new(RoutingTable::new()),
            Arc::new(HistoryLedger::in_memory()),
            Arc::new(StatisticsAggregator::new()),
            transport.clone(),
            Arc::new(sink),
            vec![Arc::new(Tag)],
            None,
        );
        engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();
        engine.dispatch(inbound(1, 1, 99, "hi")).await;

        while !matches!(events.recv().await, Some(SinkEvent::History(_))) {}
        assert_eq!(
            transport.calls_to(ChatId(10))[0].msg.text.as_deref(),
            Some("[fwd] hi")
        );
    }

    #[tokio::test]
    async fn run_consumes_feed_until_closed() {
        let mut h = Harness::new();
        h.engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let engine = h.engine.clone();
        let runner = tokio::spawn(async move { engine.run(rx).await });

        tx.send(inbound(1, 1, 99, "a")).await.unwrap();
        h.next_history().await;
        drop(tx);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn removed_rule_cannot_be_replaced() {
        let h = Harness::new();
        let handle = h
            .engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();
        let spec = h.engine.routes().get(handle.id).await.unwrap().spec();

        assert!(h.engine.unregister(handle.id).await.unwrap());
        assert!(!h.engine.unregister(handle.id).await.unwrap());
        let err = h.engine.replace(handle.id, spec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)), "got {err:?}");
        assert!(h.engine.routes().lookup(ChatId(1)).await.is_empty());
    }

    #[tokio::test]
    async fn replace_keeps_a_paused_rule_paused() {
        let h = Harness::new();
        let handle = h
            .engine
            .register(RuleSpec::new(ChatId(1), targets(&[10])))
            .await
            .unwrap();
        h.engine.pause(handle.id).await.unwrap();

        let mut spec = h.engine.routes().get(handle.id).await.unwrap().spec();
        spec.filter.user_ids.add(UserId(5));
        let new = h.engine.replace(handle.id, spec).await.unwrap();

        let rule = h.engine.routes().get(new.id).await.unwrap();
        assert_eq!(rule.status, RuleStatus::Paused);
        assert!(h.engine.routes().get(handle.id).await.is_none());
        assert_eq!(h.engine.dispatch(inbound(1, 1, 5, "a")).await.rules, 0);
    }

    fn state_dir(prefix: &str) -> std::path::PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        std::path::PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"))
    }

    #[tokio::test]
    async fn restart_restores_rules_cooldowns_stats_and_sequence() {
        let dir = state_dir("fwd-engine-restore");
        let state = Arc::new(StateDir::open(&dir).unwrap());
        let transport = Arc::new(FakeTransport::default());

        let (sink, mut events) = ChannelSink::new(64);
        let engine = ForwardingEngine::restore(
            state.clone(),
            10,
            transport.clone(),
            Arc::new(sink),
            Vec::new(),
        )
        .await
        .unwrap();
        let live = engine
            .register(RuleSpec::new(ChatId(1), targets(&[10, 20])))
            .await
            .unwrap();
        let paused = engine
            .register(RuleSpec::new(ChatId(2), targets(&[30])))
            .await
            .unwrap();
        let removed = engine
            .register(RuleSpec::new(ChatId(3), targets(&[40])))
            .await
            .unwrap();

        engine.dispatch(inbound(1, 5, 99, "a")).await;
        let mut delivered = 0;
        while delivered < 2 {
            if let Some(SinkEvent::History(_)) = events.recv().await {
                delivered += 1;
            }
        }
        engine.pause(paused.id).await.unwrap();
        engine.unregister(removed.id).await.unwrap();
        engine
            .limiter()
            .report_flood_wait(ChatId(20), Duration::from_secs(600))
            .await;
        engine.shutdown();
        engine.finish().await.unwrap();
        drop(engine);

        // A view of one entry; statistics must still cover both.
        let restored =
            ForwardingEngine::restore(state, 1, transport, Arc::new(NullSink), Vec::new())
                .await
                .unwrap();

        let rules = restored.routes().rules().await;
        let ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![live.id, paused.id]);
        assert_eq!(rules[0].status, RuleStatus::Active);
        assert_eq!(rules[1].status, RuleStatus::Paused);
        assert!(restored.routes().get(removed.id).await.is_none());
        assert!(restored.routes().lookup(ChatId(3)).await.is_empty());

        let left = restored.limiter().remaining(ChatId(20)).await.unwrap();
        assert!(left > Duration::from_secs(590));
        assert!(restored.limiter().remaining(ChatId(10)).await.is_none());

        assert_eq!(restored.ledger().len().await, 1);
        assert_eq!(restored.stats().total(EntryKind::Forwarded).await, 2);
        assert_eq!(restored.stats().get(ChatId(10), EntryKind::Forwarded).await, 1);
        assert_eq!(restored.stats().get(ChatId(20), EntryKind::Forwarded).await, 1);

        let next = restored
            .ledger()
            .append(EntryDraft::deleted(ChatId(10), MessageId(1)))
            .await
            .unwrap();
        assert_eq!(next.seq, 3);

        let fresh = restored
            .register(RuleSpec::new(ChatId(3), targets(&[40])))
            .await
            .unwrap();
        assert!(fresh.id > removed.id);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
