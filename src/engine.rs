// =============================================================================
// DataFlow engine — ingress queue, worker pool, transform→route→dispatch
// =============================================================================
//
// Submits land on one of N shard queues picked by a stable hash of the
// message identity `(exchange, symbol, kind)`, so messages for the same key
// always pass through the same worker in order, while different keys spread
// across the pool. A shared atomic depth enforces the global queue cap and
// drives the backpressure threshold events.
//
// Workers run the transform chain, evaluate the routing table, and dispatch
// to every target sink concurrently; one sink's failure or timeout never
// cancels the others. All per-message errors surface as counters and typed
// events — the engine does not throw past `submit`.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FlowError;
use crate::events::{EngineEvent, EventBus};
use crate::model::MarketMessage;
use crate::routing::{RoutingRule, RoutingTable};
use crate::runtime_config::RuntimeConfig;
use crate::sink::{BatchSink, RouteContext, Sink, SinkStatus};
use crate::transform::{TransformChain, TransformStats};

/// Samples kept for the latency percentiles.
const LATENCY_SAMPLES: usize = 1_024;
/// Smoothing factor of the throughput EMA.
const THROUGHPUT_ALPHA: f64 = 0.4;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct IngressItem {
    msg: MarketMessage,
    enqueued: Instant,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EngineCounters {
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    total_dropped: AtomicU64,
    total_unrouted: AtomicU64,
    validation_errors: AtomicU64,
    routing_errors: AtomicU64,
    sink_errors: AtomicU64,
    /// Messages finished since the last throughput tick.
    window_count: AtomicU64,
    /// EMA throughput in millimessages/s, stored scaled for atomic access.
    throughput_milli: AtomicU64,
}

/// Point-in-time engine stats, emitted on `statsUpdated` and served over the
/// status APIs.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub total_errors: u64,
    pub total_dropped: u64,
    pub total_unrouted: u64,
    pub validation_errors: u64,
    pub routing_errors: u64,
    pub sink_errors: u64,
    pub current_queue_size: usize,
    pub messages_per_second: f64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub sinks: Vec<SinkStatus>,
    pub transforms: Vec<TransformStats>,
}

// ---------------------------------------------------------------------------
// DataFlowEngine
// ---------------------------------------------------------------------------

pub struct DataFlowEngine {
    config: RuntimeConfig,
    transforms: TransformChain,
    routing: RwLock<RoutingTable>,
    sinks: RwLock<HashMap<String, Arc<dyn Sink>>>,
    shards: RwLock<Vec<mpsc::UnboundedSender<IngressItem>>>,
    state: AtomicU8,
    queue_depth: AtomicUsize,
    backpressure_active: AtomicBool,
    counters: EngineCounters,
    latencies: Mutex<VecDeque<u64>>,
    events: EventBus,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl DataFlowEngine {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let transforms = TransformChain::standard(config.monitoring.soft_latency_ms);
        Arc::new(Self {
            config,
            transforms,
            routing: RwLock::new(RoutingTable::new()),
            sinks: RwLock::new(HashMap::new()),
            shards: RwLock::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
            queue_depth: AtomicUsize::new(0),
            backpressure_active: AtomicBool::new(false),
            counters: EngineCounters::default(),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
            events: EventBus::default(),
            workers: Mutex::new(Vec::new()),
            stats_task: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Sink registry ───────────────────────────────────────────────────

    /// Register a sink under its own id. With `batching.enabled`, the sink is
    /// wrapped in a batch decorator at this point (rules keep targeting the
    /// original id).
    pub fn register_sink(&self, sink: Arc<dyn Sink>) {
        let id = sink.id().to_string();
        let registered: Arc<dyn Sink> =
            if self.config.batching.enabled && !matches!(sink.kind(), crate::sink::SinkKind::Batch)
            {
                BatchSink::wrap(
                    format!("{id}-batch"),
                    sink,
                    self.config.batching.batch_size,
                    Duration::from_millis(self.config.batching.flush_timeout_ms),
                )
            } else {
                sink
            };

        info!(sink = %id, kind = %registered.kind(), "sink registered");
        self.sinks.write().insert(id, registered);
    }

    /// Remove and close a sink. Unknown ids are a no-op.
    pub async fn unregister_sink(&self, id: &str) {
        let sink = self.sinks.write().remove(id);
        if let Some(sink) = sink {
            if let Err(e) = sink.close().await {
                warn!(sink = id, error = %e, "close on unregister failed");
            }
            info!(sink = id, "sink unregistered");
        }
    }

    /// Toggle a registered sink in place. Returns false for unknown ids.
    pub fn set_sink_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.sinks.read().get(id) {
            Some(sink) => {
                sink.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn sink_statuses(&self) -> Vec<SinkStatus> {
        let mut statuses: Vec<SinkStatus> =
            self.sinks.read().values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    // ── Routing rules ───────────────────────────────────────────────────

    pub fn add_routing_rule(&self, rule: RoutingRule) {
        debug!(rule = %rule.id, priority = rule.priority, "routing rule added");
        self.routing.write().add(rule);
    }

    pub fn remove_routing_rule(&self, id: &str) -> bool {
        self.routing.write().remove(id)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the shard workers and the stats loop. A second call is an error.
    pub fn start(self: &Arc<Self>) -> Result<(), FlowError> {
        if self
            .state
            .compare_exchange(STATE_CREATED, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FlowError::EngineStopped);
        }

        let worker_count = self.config.performance.worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = self.workers.lock();

        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel::<IngressItem>();
            senders.push(tx);
            let engine = Arc::clone(self);
            workers.push(tokio::spawn(engine.worker_loop(worker_id, rx)));
        }
        *self.shards.write() = senders;

        let engine = Arc::clone(self);
        *self.stats_task.lock() = Some(tokio::spawn(engine.stats_loop()));

        info!(workers = worker_count, "engine started");
        Ok(())
    }

    /// Drain and shut down: refuse new submits, let workers finish the queue
    /// (bounded by `processing_timeout`), flush and close every sink.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        info!(queued = self.queue_depth.load(Ordering::Relaxed), "engine stopping");

        // Closing the shard senders ends each worker loop once its queue is
        // drained.
        self.shards.write().clear();
        if let Some(stats) = self.stats_task.lock().take() {
            stats.abort();
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let deadline =
            Instant::now() + Duration::from_millis(self.config.performance.processing_timeout_ms);
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("worker did not drain within processing timeout, abandoning");
                handle.abort();
            }
        }

        let sinks: Vec<Arc<dyn Sink>> = self.sinks.read().values().cloned().collect();
        for sink in sinks {
            if let Err(e) = sink.close().await {
                warn!(sink = sink.id(), error = %e, "sink close failed");
            }
        }

        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    // ── Submit ──────────────────────────────────────────────────────────

    /// Non-blocking ingress. Rejects with a tagged error when stopped or at
    /// the hard queue cap; otherwise the message is queued on its key shard.
    pub fn submit(&self, msg: MarketMessage) -> Result<(), FlowError> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(FlowError::EngineStopped);
        }

        let capacity = self.config.performance.max_queue_size;
        let depth = self.queue_depth.load(Ordering::SeqCst);
        if depth >= capacity {
            self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(FlowError::Backpressure { depth, capacity });
        }

        let shards = self.shards.read();
        if shards.is_empty() {
            return Err(FlowError::EngineStopped);
        }
        let shard = shard_index(&msg, shards.len());

        // Depth goes up before the send so the worker-side decrement can
        // never observe it missing.
        let new_depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        if shards[shard]
            .send(IngressItem {
                msg,
                enqueued: Instant::now(),
            })
            .is_err()
        {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(FlowError::EngineStopped);
        }

        let perf = &self.config.performance;
        if perf.enable_backpressure
            && new_depth >= perf.backpressure_threshold
            && !self.backpressure_active.swap(true, Ordering::SeqCst)
        {
            warn!(depth = new_depth, "backpressure activated");
            self.events
                .emit(EngineEvent::BackpressureActivated { depth: new_depth });
        }

        Ok(())
    }

    // ── Worker ──────────────────────────────────────────────────────────

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut rx: mpsc::UnboundedReceiver<IngressItem>) {
        debug!(worker_id, "worker started");
        while let Some(item) = rx.recv().await {
            let depth = self.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;

            let perf = &self.config.performance;
            if perf.enable_backpressure
                && depth < perf.backpressure_threshold / 2
                && self.backpressure_active.swap(false, Ordering::SeqCst)
            {
                info!(depth, "backpressure deactivated");
                self.events
                    .emit(EngineEvent::BackpressureDeactivated { depth });
            }

            self.process(item).await;
        }
        debug!(worker_id, "worker drained");
    }

    async fn process(&self, item: IngressItem) {
        let identity = item.msg.identity();

        // ── Transform ───────────────────────────────────────────────────
        let msg = match self.transforms.apply(item.msg) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .validation_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(message = %identity, error = %e, "message rejected by transform");
                return;
            }
        };

        // ── Route ───────────────────────────────────────────────────────
        let outcome = self.routing.read().evaluate(&msg);
        for (rule_id, reason) in &outcome.errors {
            self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
            self.counters.routing_errors.fetch_add(1, Ordering::Relaxed);
            let err = FlowError::routing(rule_id, reason);
            warn!(message = %identity, error = %err, "routing rule failed");
            self.events.emit(EngineEvent::RoutingError {
                rule_id: rule_id.clone(),
                reason: reason.clone(),
                identity: identity.clone(),
            });
        }

        if !outcome.matched {
            self.counters.total_unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(message = %identity, "no routing rule matched");
            return;
        }

        // ── Dispatch ────────────────────────────────────────────────────
        let routed_by = outcome.matched_rules.join(",");
        let targets: Vec<Arc<dyn Sink>> = {
            let sinks = self.sinks.read();
            outcome
                .targets
                .iter()
                .filter_map(|id| match sinks.get(id) {
                    Some(sink) if sink.is_enabled() => Some(Arc::clone(sink)),
                    Some(_) => {
                        debug!(sink = %id, "target sink disabled, skipping");
                        None
                    }
                    None => {
                        debug!(sink = %id, "unknown target sink, skipping");
                        None
                    }
                })
                .collect()
        };

        let timeout = Duration::from_millis(self.config.performance.processing_timeout_ms);
        let writes = targets.iter().map(|sink| {
            let msg = msg.clone();
            let ctx = RouteContext::new(sink.id(), sink.kind(), &routed_by);
            async move {
                let started = Instant::now();
                match tokio::time::timeout(timeout, sink.write(msg, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(FlowError::Timeout {
                        sink_id: sink.id().to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            }
        });

        let results = futures_util::future::join_all(writes).await;
        for (sink, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                warn!(message = %identity, sink = sink.id(), error = %e, "sink write failed");
                self.events.emit(EngineEvent::SinkError {
                    sink_id: sink.id().to_string(),
                    reason: e.to_string(),
                    identity: identity.clone(),
                });
            }
        }

        // All matching sinks were attempted: the message counts as processed.
        self.counters.total_processed.fetch_add(1, Ordering::Relaxed);
        self.counters.window_count.fetch_add(1, Ordering::Relaxed);

        if self.config.monitoring.enable_latency_tracking {
            let elapsed_us = item.enqueued.elapsed().as_micros() as u64;
            let mut latencies = self.latencies.lock();
            if latencies.len() == LATENCY_SAMPLES {
                latencies.pop_front();
            }
            latencies.push_back(elapsed_us);
        }
    }

    // ── Stats ───────────────────────────────────────────────────────────

    /// One-second throughput tick; every `metrics_interval` it also emits a
    /// statsUpdated event when metrics are enabled.
    async fn stats_loop(self: Arc<Self>) {
        let tick = Duration::from_secs(1);
        let emit_every = self
            .config
            .monitoring
            .metrics_interval_ms
            .div_ceil(1_000)
            .max(1);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            interval.tick().await;
            let count = self.counters.window_count.swap(0, Ordering::Relaxed) as f64;
            let previous =
                self.counters.throughput_milli.load(Ordering::Relaxed) as f64 / 1_000.0;
            let ema = THROUGHPUT_ALPHA * count + (1.0 - THROUGHPUT_ALPHA) * previous;
            self.counters
                .throughput_milli
                .store((ema * 1_000.0) as u64, Ordering::Relaxed);

            ticks += 1;
            if self.config.monitoring.enable_metrics && ticks % emit_every == 0 {
                self.events.emit(EngineEvent::StatsUpdated(self.snapshot()));
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (p50, p95, p99) = {
            let latencies = self.latencies.lock();
            let mut sorted: Vec<u64> = latencies.iter().copied().collect();
            sorted.sort_unstable();
            (
                crate::sink::percentile(&sorted, 50),
                crate::sink::percentile(&sorted, 95),
                crate::sink::percentile(&sorted, 99),
            )
        };

        StatsSnapshot {
            total_processed: self.counters.total_processed.load(Ordering::Relaxed),
            total_errors: self.counters.total_errors.load(Ordering::Relaxed),
            total_dropped: self.counters.total_dropped.load(Ordering::Relaxed),
            total_unrouted: self.counters.total_unrouted.load(Ordering::Relaxed),
            validation_errors: self.counters.validation_errors.load(Ordering::Relaxed),
            routing_errors: self.counters.routing_errors.load(Ordering::Relaxed),
            sink_errors: self.counters.sink_errors.load(Ordering::Relaxed),
            current_queue_size: self.queue_depth.load(Ordering::SeqCst),
            messages_per_second: self.counters.throughput_milli.load(Ordering::Relaxed) as f64
                / 1_000.0,
            latency_p50_us: p50,
            latency_p95_us: p95,
            latency_p99_us: p99,
            sinks: self.sink_statuses(),
            transforms: self.transforms.stats(),
        }
    }

    pub fn current_queue_size(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }
}

/// Stable shard pick from the message identity.
fn shard_index(msg: &MarketMessage, shards: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    msg.exchange.hash(&mut hasher);
    msg.symbol.hash(&mut hasher);
    msg.kind.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MatchCondition;
    use crate::testing::{trade_message, RecordingSink};
    use crate::types::MessageKind;

    fn test_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.batching.enabled = false;
        config.performance.worker_count = 2;
        config.performance.processing_timeout_ms = 2_000;
        config.monitoring.enable_metrics = false;
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn exchange_rule(id: &str, exchange: &str, target: &str) -> RoutingRule {
        RoutingRule::new(
            id,
            10,
            MatchCondition::Exchange(exchange.to_string()),
            vec![target],
        )
    }

    #[tokio::test]
    async fn routes_by_exchange() {
        let engine = DataFlowEngine::new(test_config());
        let a = Arc::new(RecordingSink::new("sink-a"));
        let b = Arc::new(RecordingSink::new("sink-b"));
        let c = Arc::new(RecordingSink::new("sink-c"));
        for sink in [&a, &b, &c] {
            engine.register_sink(Arc::clone(sink) as Arc<dyn Sink>);
        }
        engine.add_routing_rule(exchange_rule("r-binance", "binance", "sink-a"));
        engine.add_routing_rule(exchange_rule("r-coinbase", "coinbase", "sink-b"));
        engine.add_routing_rule(exchange_rule("r-kraken", "kraken", "sink-c"));
        engine.start().unwrap();

        for exchange in ["binance", "coinbase", "kraken"] {
            engine.submit(trade_message(exchange, "BTCUSDT")).unwrap();
        }

        wait_until(|| a.write_count() == 1 && b.write_count() == 1 && c.write_count() == 1).await;
        assert_eq!(a.messages()[0].exchange, "binance");
        assert_eq!(b.messages()[0].exchange, "coinbase");
        assert_eq!(c.messages()[0].exchange, "kraken");
        assert_eq!(engine.snapshot().total_processed, 3);

        engine.stop().await;
    }

    #[tokio::test]
    async fn priority_union_counts() {
        let engine = DataFlowEngine::new(test_config());
        let premium = Arc::new(RecordingSink::new("premium"));
        let standard = Arc::new(RecordingSink::new("standard"));
        let basic = Arc::new(RecordingSink::new("basic"));
        for sink in [&premium, &standard, &basic] {
            engine.register_sink(Arc::clone(sink) as Arc<dyn Sink>);
        }

        engine.add_routing_rule(RoutingRule::new(
            "premium",
            100,
            MatchCondition::All(vec![
                MatchCondition::Exchange("binance".into()),
                MatchCondition::SymbolContains("BTC".into()),
                MatchCondition::Kind(MessageKind::Trade),
            ]),
            vec!["premium"],
        ));
        engine.add_routing_rule(RoutingRule::new(
            "standard",
            50,
            MatchCondition::Exchange("binance".into()),
            vec!["standard"],
        ));
        engine.add_routing_rule(RoutingRule::catch_all("basic", vec!["basic"]));
        engine.start().unwrap();

        engine.submit(trade_message("binance", "BTCUSDT")).unwrap();
        let mut ticker = trade_message("binance", "ETHUSDT");
        ticker.kind = MessageKind::Ticker;
        ticker.data = crate::model::MessagePayload::Ticker(crate::model::TickerData {
            last: 3_000.0,
            bid: None,
            ask: None,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
        });
        engine.submit(ticker).unwrap();
        engine.submit(trade_message("coinbase", "BTCUSD")).unwrap();

        wait_until(|| basic.write_count() == 3).await;
        assert_eq!(premium.write_count(), 1);
        assert_eq!(standard.write_count(), 2);
        assert_eq!(basic.write_count(), 3);

        // routedBy names every matching rule for the premium message.
        let ctx = &premium.contexts()[0];
        assert!(ctx.routed_by.contains("premium"));
        assert!(ctx.routed_by.contains("basic"));

        engine.stop().await;
    }

    #[tokio::test]
    async fn per_key_fifo_into_each_sink() {
        let mut config = test_config();
        config.performance.worker_count = 4;
        let engine = DataFlowEngine::new(config);
        let sink = Arc::new(RecordingSink::new("sink"));
        engine.register_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["sink"]));
        engine.start().unwrap();

        for i in 0..50 {
            let mut msg = trade_message("binance", "BTCUSDT");
            msg.timestamp = i + 1;
            engine.submit(msg).unwrap();
        }

        wait_until(|| sink.write_count() == 50).await;
        let timestamps: Vec<i64> = sink.messages().iter().map(|m| m.timestamp).collect();
        let expected: Vec<i64> = (1..=50).collect();
        assert_eq!(timestamps, expected);

        engine.stop().await;
    }

    #[tokio::test]
    async fn unknown_and_disabled_targets_skipped() {
        let engine = DataFlowEngine::new(test_config());
        let sink = Arc::new(RecordingSink::new("real"));
        let muted = Arc::new(RecordingSink::new("muted"));
        engine.register_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        engine.register_sink(Arc::clone(&muted) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["ghost", "real", "muted"]));
        assert!(engine.set_sink_enabled("muted", false));
        assert!(!engine.set_sink_enabled("ghost", false));
        engine.start().unwrap();

        engine.submit(trade_message("binance", "BTCUSDT")).unwrap();
        wait_until(|| sink.write_count() == 1).await;

        let stats = engine.snapshot();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_errors, 0);
        assert_eq!(muted.write_count(), 0);

        engine.stop().await;
    }

    #[tokio::test]
    async fn sink_failure_does_not_cancel_others() {
        let engine = DataFlowEngine::new(test_config());
        let failing = Arc::new(RecordingSink::new("failing"));
        failing.fail_always();
        let healthy = Arc::new(RecordingSink::new("healthy"));
        engine.register_sink(Arc::clone(&failing) as Arc<dyn Sink>);
        engine.register_sink(Arc::clone(&healthy) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["failing", "healthy"]));

        let mut events = engine.events().subscribe();
        engine.start().unwrap();
        engine.submit(trade_message("binance", "BTCUSDT")).unwrap();

        wait_until(|| healthy.write_count() == 1).await;
        let stats = engine.snapshot();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.sink_errors, 1);

        let event = events.recv().await.unwrap();
        match event {
            EngineEvent::SinkError { sink_id, identity, .. } => {
                assert_eq!(sink_id, "failing");
                assert_eq!(identity, "binance:BTCUSDT:trade");
            }
            other => panic!("unexpected event {}", other.name()),
        }

        engine.stop().await;
    }

    #[tokio::test]
    async fn routing_error_skips_rule_and_emits() {
        let engine = DataFlowEngine::new(test_config());
        let sink = Arc::new(RecordingSink::new("sink"));
        engine.register_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::new(
            "broken",
            100,
            MatchCondition::Custom(Arc::new(|_| Err("boom".to_string()))),
            vec!["sink"],
        ));
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["sink"]));

        let mut events = engine.events().subscribe();
        engine.start().unwrap();
        engine.submit(trade_message("binance", "BTCUSDT")).unwrap();

        wait_until(|| sink.write_count() == 1).await;
        assert_eq!(engine.snapshot().routing_errors, 1);
        match events.recv().await.unwrap() {
            EngineEvent::RoutingError { rule_id, .. } => assert_eq!(rule_id, "broken"),
            other => panic!("unexpected event {}", other.name()),
        }

        engine.stop().await;
    }

    #[tokio::test]
    async fn validation_failure_drops_message() {
        let engine = DataFlowEngine::new(test_config());
        let sink = Arc::new(RecordingSink::new("sink"));
        engine.register_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["sink"]));
        engine.start().unwrap();

        let mut bad = trade_message("binance", "BTCUSDT");
        bad.timestamp = 0;
        bad.data = crate::model::MessagePayload::Raw(serde_json::json!({"price": 1.0}));
        engine.submit(bad).unwrap();

        wait_until(|| engine.snapshot().validation_errors == 1).await;
        assert_eq!(sink.write_count(), 0);
        assert_eq!(engine.snapshot().total_processed, 0);

        engine.stop().await;
    }

    #[tokio::test]
    async fn queue_cap_rejects_and_counts_dropped() {
        let mut config = test_config();
        config.performance.max_queue_size = 4;
        config.performance.worker_count = 1;
        config.performance.enable_backpressure = false;
        let engine = DataFlowEngine::new(config);
        let slow = Arc::new(RecordingSink::new("slow").with_delay(Duration::from_millis(50)));
        engine.register_sink(Arc::clone(&slow) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["slow"]));
        engine.start().unwrap();

        let mut rejected = 0u64;
        for _ in 0..20 {
            match engine.submit(trade_message("binance", "BTCUSDT")) {
                Ok(()) => {}
                Err(FlowError::Backpressure { depth, capacity }) => {
                    assert!(depth >= capacity);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
            assert!(engine.current_queue_size() <= 4);
        }
        assert!(rejected > 0);
        assert_eq!(engine.snapshot().total_dropped, rejected);

        engine.stop().await;
    }

    #[tokio::test]
    async fn backpressure_events_fire_and_balance() {
        let mut config = test_config();
        config.performance.max_queue_size = 1_000;
        config.performance.backpressure_threshold = 100;
        config.performance.worker_count = 1;
        let engine = DataFlowEngine::new(config);
        let slow = Arc::new(RecordingSink::new("slow").with_delay(Duration::from_millis(2)));
        engine.register_sink(Arc::clone(&slow) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["slow"]));

        let mut events = engine.events().subscribe();
        engine.start().unwrap();

        for _ in 0..300 {
            engine.submit(trade_message("binance", "BTCUSDT")).unwrap();
        }

        wait_until(|| slow.write_count() == 300).await;
        assert!(engine.current_queue_size() < 100);

        let mut activated = 0;
        let mut deactivated = 0;
        let mut activation_depth = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::BackpressureActivated { depth } => {
                    activated += 1;
                    activation_depth = depth;
                }
                EngineEvent::BackpressureDeactivated { .. } => deactivated += 1,
                _ => {}
            }
        }
        assert!(activated >= 1);
        assert!(activation_depth >= 100);
        assert!((activated as i64 - deactivated as i64).abs() <= 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_batched_sinks_and_is_idempotent() {
        let mut config = test_config();
        config.batching.enabled = true;
        config.batching.batch_size = 100;
        config.batching.flush_timeout_ms = 60_000;
        let engine = DataFlowEngine::new(config);
        let inner = Arc::new(RecordingSink::new("sink"));
        engine.register_sink(Arc::clone(&inner) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["sink"]));
        engine.start().unwrap();

        for _ in 0..5 {
            engine.submit(trade_message("binance", "BTCUSDT")).unwrap();
        }

        // Give workers time to move messages into the batch buffer, then stop:
        // the close-side flush must deliver all five.
        wait_until(|| engine.snapshot().total_processed == 5).await;
        assert_eq!(inner.write_count(), 0);

        engine.stop().await;
        assert_eq!(inner.write_count(), 5);
        assert_eq!(inner.close_count(), 1);
        assert!(inner.messages()[0]
            .meta_str(crate::model::meta::BATCHED_BY)
            .is_some());

        engine.stop().await;
        assert_eq!(inner.close_count(), 1);

        let err = engine.submit(trade_message("binance", "BTCUSDT")).unwrap_err();
        assert!(matches!(err, FlowError::EngineStopped));
    }

    #[tokio::test]
    async fn stats_updated_event_is_emitted() {
        let mut config = test_config();
        config.monitoring.enable_metrics = true;
        config.monitoring.metrics_interval_ms = 1_000;
        let engine = DataFlowEngine::new(config);
        let sink = Arc::new(RecordingSink::new("sink"));
        engine.register_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        engine.add_routing_rule(RoutingRule::catch_all("all", vec!["sink"]));

        let mut events = engine.events().subscribe();
        engine.start().unwrap();
        engine.submit(trade_message("binance", "BTCUSDT")).unwrap();

        // Early ticks may fire before the message clears the pipeline; wait
        // for the first snapshot that includes it.
        let snapshot = loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("no statsUpdated within 10s")
                .unwrap()
            {
                EngineEvent::StatsUpdated(snapshot) if snapshot.total_processed == 1 => {
                    break snapshot
                }
                _ => continue,
            }
        };
        assert_eq!(snapshot.sinks.len(), 1);

        engine.stop().await;
    }
}
