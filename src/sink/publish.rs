// =============================================================================
// PublishSink — broker topic delivery
// =============================================================================
//
// Topic names are `{prefix}-{family}-{exchange}`; every kline interval
// collapses onto the `kline` family so one topic carries them all. The broker
// transport itself is an external collaborator behind [`BrokerClient`]; the
// bundled [`LogBroker`] logs and counts, which is enough for local runs.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{RouteContext, Sink, SinkCounters, SinkKind, SinkStatus};
use crate::error::FlowError;
use crate::model::{meta, MarketMessage};

/// The outbound broker contract: fire one payload at a topic with
/// string-valued attributes.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        attributes: HashMap<String, String>,
    ) -> Result<(), String>;
}

/// Broker stand-in that logs every publish. Useful until a real transport is
/// wired in, and for smoke-testing topic fan-out.
#[derive(Debug, Default)]
pub struct LogBroker {
    published: AtomicU64,
}

impl LogBroker {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerClient for LogBroker {
    async fn publish(
        &self,
        topic: &str,
        _payload: Value,
        attributes: HashMap<String, String>,
    ) -> Result<(), String> {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, ?attributes, "publish");
        Ok(())
    }
}

pub struct PublishSink {
    id: String,
    topic_prefix: String,
    broker: Arc<dyn BrokerClient>,
    counters: SinkCounters,
}

impl PublishSink {
    pub fn new(
        id: impl Into<String>,
        topic_prefix: impl Into<String>,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            id: id.into(),
            topic_prefix: topic_prefix.into(),
            broker,
            counters: SinkCounters::new(),
        }
    }

    pub fn topic_for(&self, msg: &MarketMessage) -> String {
        format!(
            "{}-{}-{}",
            self.topic_prefix,
            msg.kind.as_str(),
            msg.exchange
        )
    }

    fn attributes(&self, msg: &MarketMessage, ctx: &RouteContext) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        attributes.insert("exchange".to_string(), msg.exchange.clone());
        attributes.insert("symbol".to_string(), msg.symbol.clone());
        attributes.insert("type".to_string(), msg.kind.as_str().to_string());
        attributes.insert(
            "source".to_string(),
            msg.meta_str(meta::SOURCE).unwrap_or_default().to_string(),
        );
        attributes.insert("channelId".to_string(), ctx.channel_id.clone());
        attributes.insert("channelType".to_string(), ctx.channel_type.clone());
        attributes.insert("routedBy".to_string(), ctx.routed_by.clone());
        attributes
    }
}

#[async_trait]
impl Sink for PublishSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Publish
    }

    async fn write(&self, msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError> {
        let started = Instant::now();
        let topic = self.topic_for(&msg);
        let attributes = self.attributes(&msg, ctx);

        let payload = match serde_json::to_value(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.record(started, false);
                return Err(FlowError::sink(&self.id, format!("serialization: {e}")));
            }
        };

        match self.broker.publish(&topic, payload, attributes).await {
            Ok(()) => {
                self.counters.record(started, true);
                Ok(())
            }
            Err(reason) => {
                self.counters.record(started, false);
                Err(FlowError::sink(&self.id, reason))
            }
        }
    }

    fn status(&self) -> SinkStatus {
        self.counters.snapshot(&self.id, SinkKind::Publish)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessagePayload, TradeData};
    use crate::testing::RecordingBroker;
    use crate::types::{MessageKind, SinkHealth, TradeSide};
    use serde_json::json;

    fn trade(exchange: &str) -> MarketMessage {
        let mut msg = MarketMessage::new(
            exchange,
            "BTCUSDT",
            MessageKind::Trade,
            MessagePayload::Trade(TradeData {
                price: 100.0,
                quantity: 1.0,
                side: TradeSide::Buy,
                trade_id: None,
            }),
        );
        msg.set_meta(meta::SOURCE, json!("exchange-collector"));
        msg
    }

    fn kline(exchange: &str, interval: &str) -> MarketMessage {
        MarketMessage::new(
            exchange,
            "BTCUSDT",
            MessageKind::Kline,
            MessagePayload::Kline(crate::model::KlineData {
                interval: interval.to_string(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
                open_time: 1,
                close_time: 2,
                closed: true,
            }),
        )
    }

    #[tokio::test]
    async fn topic_and_attributes() {
        let broker = Arc::new(RecordingBroker::default());
        let sink = PublishSink::new("pub", "market-data", broker.clone());
        let ctx = RouteContext::new("pub", SinkKind::Publish, "rule-1");

        sink.write(trade("binance"), &ctx).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let (topic, payload, attributes) = &published[0];
        assert_eq!(topic, "market-data-trade-binance");
        assert_eq!(payload["symbol"], "BTCUSDT");
        assert_eq!(attributes["exchange"], "binance");
        assert_eq!(attributes["source"], "exchange-collector");
        assert_eq!(attributes["channelId"], "pub");
        assert_eq!(attributes["channelType"], "publish");
        assert_eq!(attributes["routedBy"], "rule-1");
    }

    #[tokio::test]
    async fn kline_intervals_collapse_to_one_topic() {
        let broker = Arc::new(RecordingBroker::default());
        let sink = PublishSink::new("pub", "market-data", broker.clone());
        let ctx = RouteContext::new("pub", SinkKind::Publish, "r");

        sink.write(kline("binance", "1m"), &ctx).await.unwrap();
        sink.write(kline("binance", "5m"), &ctx).await.unwrap();

        let published = broker.published();
        assert_eq!(published[0].0, "market-data-kline-binance");
        assert_eq!(published[1].0, "market-data-kline-binance");
    }

    #[tokio::test]
    async fn broker_failure_counts_and_degrades() {
        let broker = Arc::new(RecordingBroker::failing("broker unavailable"));
        let sink = PublishSink::new("pub", "market-data", broker);
        let ctx = RouteContext::new("pub", SinkKind::Publish, "r");

        for _ in 0..5 {
            let err = sink.write(trade("binance"), &ctx).await.unwrap_err();
            assert_eq!(err.class(), "sink");
        }

        let status = sink.status();
        assert_eq!(status.errors, 5);
        assert_eq!(status.messages_sent, 0);
        assert_eq!(status.health, SinkHealth::Unhealthy);
    }
}
