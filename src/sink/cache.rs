// =============================================================================
// CacheSink — last-write-wins writes into the market cache
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use super::{RouteContext, Sink, SinkCounters, SinkKind, SinkStatus};
use crate::cache::MarketCache;
use crate::error::FlowError;
use crate::model::{meta, now_ms, MarketMessage};

pub struct CacheSink {
    id: String,
    cache: Arc<MarketCache>,
    counters: SinkCounters,
}

impl CacheSink {
    pub fn new(id: impl Into<String>, cache: Arc<MarketCache>) -> Self {
        Self {
            id: id.into(),
            cache,
            counters: SinkCounters::new(),
        }
    }
}

#[async_trait]
impl Sink for CacheSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Cache
    }

    async fn write(&self, mut msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError> {
        let started = Instant::now();

        msg.set_meta(meta::CACHED_AT, json!(now_ms()));
        msg.set_meta(meta::CHANNEL_ID, json!(ctx.channel_id));
        msg.set_meta(meta::CHANNEL_TYPE, json!(ctx.channel_type));

        let key = msg.identity();
        self.cache.put(key, msg);

        self.counters.record(started, true);
        Ok(())
    }

    fn status(&self) -> SinkStatus {
        self.counters.snapshot(&self.id, SinkKind::Cache)
    }

    async fn close(&self) -> Result<(), FlowError> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.counters.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.counters.set_enabled(enabled);
    }
}
