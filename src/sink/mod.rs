// =============================================================================
// Output sinks
// =============================================================================
//
// Every destination implements the same narrow contract: `write` returns a
// tagged error instead of throwing, `status` reports counters and derived
// health, `close` flushes and is idempotent. The batch decorator wraps any
// other sink when engine-level batching is on.
// =============================================================================

pub mod batch;
pub mod cache;
pub mod publish;
pub mod websocket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::FlowError;
use crate::model::{now_ms, MarketMessage};
use crate::types::SinkHealth;

pub use batch::BatchSink;
pub use cache::CacheSink;
pub use publish::{BrokerClient, LogBroker, PublishSink};
pub use websocket::WebSocketSink;

/// Writes tracked by the health/latency window.
const RECENT_WINDOW: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Publish,
    Websocket,
    Cache,
    Batch,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Websocket => "websocket",
            Self::Cache => "cache",
            Self::Batch => "batch",
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing annotations handed to a sink along with the message.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// Target sink id the router selected.
    pub channel_id: String,
    /// Sink kind as a string, for wire metadata.
    pub channel_type: String,
    /// Ids of the rules that routed the message, comma-joined.
    pub routed_by: String,
}

impl RouteContext {
    pub fn new(channel_id: &str, channel_type: SinkKind, routed_by: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            channel_type: channel_type.as_str().to_string(),
            routed_by: routed_by.to_string(),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> SinkKind;

    /// Deliver one message. Errors are returned, never thrown across the
    /// interface.
    async fn write(&self, msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError>;

    fn status(&self) -> SinkStatus;

    /// Flush buffered state and release resources. Idempotent.
    async fn close(&self) -> Result<(), FlowError>;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Toggle the sink without unregistering it. Disabled sinks are skipped
    /// at dispatch time.
    fn set_enabled(&self, _enabled: bool) {}
}

/// Point-in-time view of one sink.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStatus {
    pub id: String,
    pub kind: SinkKind,
    pub enabled: bool,
    pub health: SinkHealth,
    pub messages_sent: u64,
    pub errors: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub last_activity_ms: i64,
}

/// Counter block shared by every sink implementation.
#[derive(Debug)]
pub struct SinkCounters {
    messages_sent: AtomicU64,
    errors: AtomicU64,
    enabled: AtomicBool,
    last_activity_ms: AtomicI64,
    /// Outcome + latency of the most recent writes.
    recent: Mutex<VecDeque<(bool, u64)>>,
}

impl SinkCounters {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            last_activity_ms: AtomicI64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
        }
    }

    pub fn record(&self, started: Instant, ok: bool) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        if ok {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back((ok, elapsed_us));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Health from the error ratio of the recent window.
    pub fn health(&self) -> SinkHealth {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return SinkHealth::Healthy;
        }
        let failures = recent.iter().filter(|(ok, _)| !ok).count();
        SinkHealth::from_error_ratio(failures as f64 / recent.len() as f64)
    }

    pub fn snapshot(&self, id: &str, kind: SinkKind) -> SinkStatus {
        let (p95, p99) = {
            let recent = self.recent.lock();
            let mut latencies: Vec<u64> = recent.iter().map(|(_, l)| *l).collect();
            latencies.sort_unstable();
            (percentile(&latencies, 95), percentile(&latencies, 99))
        };

        SinkStatus {
            id: id.to_string(),
            kind,
            enabled: self.is_enabled(),
            health: self.health(),
            messages_sent: self.messages_sent(),
            errors: self.errors(),
            latency_p95_us: p95,
            latency_p99_us: p99,
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for SinkCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over a sorted slice; 0 for an empty one.
pub(crate) fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
