// =============================================================================
// WebSocketSink — subscription-filtered fan-out through the connection pool
// =============================================================================
//
// Builds the wire envelope (`type` = message kind, `payload` = the message
// with routing metadata merged in) and hands it to the pool's broadcast,
// filtered by the sink's channel label. Delivering to zero subscribers is not
// an error; a broken pool serialization is.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{RouteContext, Sink, SinkCounters, SinkKind, SinkStatus};
use crate::error::FlowError;
use crate::model::{meta, now_ms, MarketMessage};
use crate::ws::ConnectionPool;

pub struct WebSocketSink {
    id: String,
    /// Clients subscribe to this label to receive the sink's traffic.
    channel: String,
    pool: Arc<ConnectionPool>,
    counters: SinkCounters,
}

impl WebSocketSink {
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            pool,
            counters: SinkCounters::new(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wire envelope: the full message under `payload`, routing annotations
    /// merged into its metadata, the kind repeated as the envelope `type`.
    fn envelope(&self, msg: &MarketMessage, ctx: &RouteContext) -> Result<Value, FlowError> {
        let mut payload = serde_json::to_value(msg)
            .map_err(|e| FlowError::sink(&self.id, format!("serialization: {e}")))?;

        if let Some(metadata) = payload
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.insert(meta::CHANNEL_ID.to_string(), json!(ctx.channel_id));
            metadata.insert(meta::CHANNEL_TYPE.to_string(), json!(ctx.channel_type));
            metadata.insert(meta::ROUTED_BY.to_string(), json!(ctx.routed_by));
        }

        Ok(json!({
            "type": msg.kind.as_str(),
            "payload": payload,
            "timestamp": now_ms(),
        }))
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Websocket
    }

    async fn write(&self, msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError> {
        let started = Instant::now();
        let envelope = match self.envelope(&msg, ctx) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.record(started, false);
                return Err(e);
            }
        };

        self.pool.broadcast(&envelope, Some(&self.channel));
        self.counters.record(started, true);
        Ok(())
    }

    fn status(&self) -> SinkStatus {
        self.counters.snapshot(&self.id, SinkKind::Websocket)
    }

    async fn close(&self) -> Result<(), FlowError> {
        self.pool.flush_all(true);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.counters.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.counters.set_enabled(enabled);
    }
}
