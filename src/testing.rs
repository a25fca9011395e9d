// =============================================================================
// Test fixtures shared across module tests
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::FlowError;
use crate::model::{MarketMessage, MessagePayload, TradeData};
use crate::sink::{BrokerClient, RouteContext, Sink, SinkCounters, SinkKind, SinkStatus};
use crate::types::{MessageKind, TradeSide};

/// Build a valid, already-standardized trade message.
pub fn trade_message(exchange: &str, symbol: &str) -> MarketMessage {
    MarketMessage::new(
        exchange,
        symbol,
        MessageKind::Trade,
        MessagePayload::Trade(TradeData {
            price: 100.0,
            quantity: 1.0,
            side: TradeSide::Buy,
            trade_id: Some("t-1".to_string()),
        }),
    )
}

/// Broker that records every publish, optionally failing them all.
#[derive(Default)]
pub struct RecordingBroker {
    calls: Mutex<Vec<(String, Value, HashMap<String, String>)>>,
    fail_with: Option<String>,
}

impl RecordingBroker {
    pub fn failing(reason: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn published(&self) -> Vec<(String, Value, HashMap<String, String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for RecordingBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        attributes: HashMap<String, String>,
    ) -> Result<(), String> {
        if let Some(reason) = &self.fail_with {
            return Err(reason.clone());
        }
        self.calls
            .lock()
            .push((topic.to_string(), payload, attributes));
        Ok(())
    }
}

/// Sink that collects everything written to it, with optional per-write delay
/// and scripted failures.
pub struct RecordingSink {
    id: String,
    writes: Mutex<Vec<(MarketMessage, RouteContext)>>,
    write_delay: Option<Duration>,
    fail_always: AtomicBool,
    closes: AtomicU64,
    counters: SinkCounters,
}

impl RecordingSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            writes: Mutex::new(Vec::new()),
            write_delay: None,
            fail_always: AtomicBool::new(false),
            closes: AtomicU64::new(0),
            counters: SinkCounters::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<MarketMessage> {
        self.writes.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn contexts(&self) -> Vec<RouteContext> {
        self.writes.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Cache
    }

    async fn write(&self, msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError> {
        let started = Instant::now();
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_always.load(Ordering::SeqCst) {
            self.counters.record(started, false);
            return Err(FlowError::sink(&self.id, "scripted failure"));
        }
        self.writes.lock().push((msg, ctx.clone()));
        self.counters.record(started, true);
        Ok(())
    }

    fn status(&self) -> SinkStatus {
        self.counters.snapshot(&self.id, SinkKind::Cache)
    }

    async fn close(&self) -> Result<(), FlowError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.counters.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.counters.set_enabled(enabled);
    }
}
