// =============================================================================
// Connection pool — owns every client WebSocket connection
// =============================================================================
//
// Each connection's socket writes happen on a dedicated writer task fed by an
// unbounded channel, so per-connection ordering holds no matter which task
// broadcasts. The pool itself only ever touches the channel sender; a send
// failure means the writer task is gone and the connection is removed.
//
// Optional per-connection batching buffers envelopes and emits a single
// `{type:"batch"}` frame on size or interval triggers; shutdown drains with
// `batch_final`. A buffered-bytes watchdog force-flushes everything when the
// total crosses the memory threshold.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::FlowError;
use crate::model::now_ms;
use crate::runtime_config::PoolConfig;
use crate::types::ConnState;

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

struct SendBuffer {
    envelopes: Vec<Value>,
    bytes: usize,
}

pub struct PooledConnection {
    pub id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: RwLock<ConnState>,
    connected_at: Instant,
    last_activity: RwLock<Instant>,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
    subscriptions: RwLock<HashSet<String>>,
    buffer: Mutex<SendBuffer>,
    pub metadata: RwLock<HashMap<String, Value>>,
}

/// Serializable per-connection stats, returned on `getStats`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: String,
    pub state: ConnState,
    pub uptime_ms: u64,
    pub last_activity_age_ms: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub subscriptions: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl PooledConnection {
    fn new(
        id: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id,
            outbound,
            state: RwLock::new(ConnState::Connecting),
            connected_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            subscriptions: RwLock::new(HashSet::new()),
            buffer: Mutex::new(SendBuffer {
                envelopes: Vec::new(),
                bytes: 0,
            }),
            metadata: RwLock::new(metadata),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.write() = state;
    }

    /// Record inbound activity; idle cleanup keys off this.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn subscribe(&self, channel: &str) -> bool {
        self.subscriptions.write().insert(channel.to_string())
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.subscriptions.write().remove(channel)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        subs.sort();
        subs
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Queue a text frame onto the writer task. Fails when the writer is
    /// gone, which marks the connection dead.
    pub fn send_text(&self, text: String) -> Result<(), FlowError> {
        let bytes = text.len() as u64;
        match self.outbound.send(Outbound::Text(text)) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(FlowError::transport(&self.id, "writer task gone"))
            }
        }
    }

    pub fn send_ping(&self) -> Result<(), FlowError> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|_| FlowError::transport(&self.id, "writer task gone"))
    }

    pub fn request_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id.clone(),
            state: self.state(),
            uptime_ms: self.connected_at.elapsed().as_millis() as u64,
            last_activity_age_ms: self.idle_for().as_millis() as u64,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            subscriptions: self.subscriptions(),
            metadata: self.metadata.read().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// Aggregate pool stats, served on `getSystemStats` and to the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub open_connections: usize,
    pub max_connections: usize,
    pub utilization: f64,
    pub total_added: u64,
    pub total_removed: u64,
    pub broadcasts: u64,
    pub send_errors: u64,
    pub recent_send_errors: u64,
    pub buffered_bytes: usize,
}

pub struct ConnectionPool {
    config: PoolConfig,
    connections: RwLock<HashMap<String, Arc<PooledConnection>>>,
    buffered_bytes: AtomicUsize,
    total_added: AtomicU64,
    total_removed: AtomicU64,
    broadcasts: AtomicU64,
    send_errors: AtomicU64,
    /// Errors since the last heartbeat tick; drives the health signal.
    recent_send_errors: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            buffered_bytes: AtomicUsize::new(0),
            total_added: AtomicU64::new(0),
            total_removed: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recent_send_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admit a connection. Returns `None` when the pool is full or the id is
    /// already present.
    pub fn add(
        &self,
        id: &str,
        outbound: mpsc::UnboundedSender<Outbound>,
        metadata: HashMap<String, Value>,
    ) -> Option<Arc<PooledConnection>> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            warn!(id, limit = self.config.max_connections, "pool full, connection rejected");
            return None;
        }
        if connections.contains_key(id) {
            warn!(id, "duplicate connection id rejected");
            return None;
        }

        let conn = Arc::new(PooledConnection::new(id.to_string(), outbound, metadata));
        connections.insert(id.to_string(), Arc::clone(&conn));
        self.total_added.fetch_add(1, Ordering::Relaxed);
        info!(id, total = connections.len(), "connection added");
        Some(conn)
    }

    pub fn mark_open(&self, id: &str) {
        if let Some(conn) = self.get(id) {
            conn.set_state(ConnState::Open);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<PooledConnection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Remove a connection: final state, buffer flushed-then-dropped, writer
    /// asked to close.
    pub fn remove(&self, id: &str, state: ConnState) -> bool {
        let conn = match self.connections.write().remove(id) {
            Some(conn) => conn,
            None => return false,
        };
        self.total_removed.fetch_add(1, Ordering::Relaxed);
        conn.set_state(state);
        self.flush_connection(&conn, true);
        conn.request_close();
        info!(id, state = %state, remaining = self.len(), "connection removed");
        true
    }

    // ── Broadcast ───────────────────────────────────────────────────────

    /// Deliver one envelope to every open connection matching the channel
    /// predicate. Dead connections found along the way are removed. Returns
    /// the number of deliveries.
    pub fn broadcast(&self, envelope: &Value, channel: Option<&str>) -> usize {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Arc<PooledConnection>> = {
            let connections = self.connections.read();
            connections
                .values()
                .filter(|c| c.state() == ConnState::Open)
                .filter(|c| channel.map_or(true, |ch| c.is_subscribed(ch)))
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();
        let text = envelope.to_string();

        for conn in targets {
            let result = if self.config.enable_batching {
                self.buffer_envelope(&conn, envelope)
            } else {
                conn.send_text(text.clone())
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(id = %conn.id, error = %e, "broadcast send failed");
                    self.send_errors.fetch_add(1, Ordering::Relaxed);
                    self.recent_send_errors.fetch_add(1, Ordering::Relaxed);
                    dead.push(conn.id.clone());
                }
            }
        }

        for id in dead {
            self.remove(&id, ConnState::Error);
        }
        delivered
    }

    /// Buffer one envelope for a batching connection; flushes on size.
    fn buffer_envelope(
        &self,
        conn: &Arc<PooledConnection>,
        envelope: &Value,
    ) -> Result<(), FlowError> {
        let full = {
            let mut buffer = conn.buffer.lock();
            let bytes = envelope.to_string().len();
            buffer.envelopes.push(envelope.clone());
            buffer.bytes += bytes;
            self.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
            buffer.envelopes.len() >= self.config.batch_size
        };
        if full {
            self.flush_connection(conn, false);
        }
        Ok(())
    }

    /// Drain a connection's buffer into one batch frame. `final_flush` marks
    /// the shutdown variant.
    pub fn flush_connection(&self, conn: &Arc<PooledConnection>, final_flush: bool) {
        let (envelopes, bytes) = {
            let mut buffer = conn.buffer.lock();
            let bytes = buffer.bytes;
            buffer.bytes = 0;
            (std::mem::take(&mut buffer.envelopes), bytes)
        };
        self.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
        if envelopes.is_empty() {
            return;
        }

        let frame = json!({
            "type": if final_flush { "batch_final" } else { "batch" },
            "messages": envelopes,
            "count": envelopes.len(),
            "timestamp": now_ms(),
        });
        if let Err(e) = conn.send_text(frame.to_string()) {
            debug!(id = %conn.id, error = %e, "batch flush failed");
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            self.recent_send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Flush every buffered connection.
    pub fn flush_all(&self, final_flush: bool) {
        let connections: Vec<Arc<PooledConnection>> =
            self.connections.read().values().cloned().collect();
        for conn in connections {
            self.flush_connection(&conn, final_flush);
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// Buffered-bytes stand-in for heap sampling: past the threshold, every
    /// buffer is force-flushed.
    pub fn check_memory_pressure(&self) -> bool {
        let buffered = self.buffered_bytes();
        if buffered > self.config.memory_threshold_bytes {
            warn!(
                buffered,
                threshold = self.config.memory_threshold_bytes,
                "memory threshold exceeded, force-flushing all buffers"
            );
            self.flush_all(false);
            true
        } else {
            false
        }
    }

    // ── Heartbeat / cleanup ─────────────────────────────────────────────

    /// Ping every open connection and remove the idle ones. Returns the ids
    /// removed. Called from the heartbeat task.
    pub fn heartbeat(&self) -> Vec<String> {
        let timeout = Duration::from_millis(self.config.connection_timeout_ms);
        let connections: Vec<Arc<PooledConnection>> =
            self.connections.read().values().cloned().collect();

        let mut removed = Vec::new();
        for conn in connections {
            if conn.idle_for() >= timeout {
                removed.push(conn.id.clone());
                continue;
            }
            if conn.state() == ConnState::Open && conn.send_ping().is_err() {
                removed.push(conn.id.clone());
            }
        }

        for id in &removed {
            self.remove(id, ConnState::Closed);
        }
        self.recent_send_errors.store(0, Ordering::Relaxed);
        removed
    }

    // ── Stats / health ──────────────────────────────────────────────────

    pub fn stats(&self) -> PoolStats {
        let connections = self.connections.read();
        let open = connections
            .values()
            .filter(|c| c.state() == ConnState::Open)
            .count();
        let utilization = if self.config.max_connections > 0 {
            connections.len() as f64 / self.config.max_connections as f64
        } else {
            0.0
        };
        PoolStats {
            connections: connections.len(),
            open_connections: open,
            max_connections: self.config.max_connections,
            utilization,
            total_added: self.total_added.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recent_send_errors: self.recent_send_errors.load(Ordering::Relaxed),
            buffered_bytes: self.buffered_bytes(),
        }
    }

    /// Healthy while below 90% utilization with few recent send errors.
    pub fn is_healthy(&self, channel_error_threshold: u64) -> bool {
        let stats = self.stats();
        stats.utilization < 0.9 && stats.recent_send_errors < channel_error_threshold
    }

    /// Shutdown: final-flush all buffers and ask every writer to close.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.remove(&id, ConnState::Closed);
        }
    }
}

/// Periodic heartbeat/cleanup loop; spawned from main.
pub async fn run_heartbeat(pool: Arc<ConnectionPool>) {
    let period = Duration::from_millis(pool.config.heartbeat_interval_ms.max(1_000));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let removed = pool.heartbeat();
        if !removed.is_empty() {
            info!(count = removed.len(), "idle connections removed");
        }
    }
}

/// Periodic buffer flush + memory watchdog loop; spawned from main when
/// batching is enabled.
pub async fn run_flusher(pool: Arc<ConnectionPool>) {
    let period = Duration::from_millis(pool.config.flush_interval_ms.max(10));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        pool.check_memory_pressure();
        pool.flush_all(false);
    }
}
