// =============================================================================
// MarketMessage — canonical in-memory record
// =============================================================================
//
// One record per market event, owned by the engine from submit until every
// sink has accepted or rejected it. Adapters construct messages through
// [`MarketMessage::from_raw`] with an untyped JSON payload; the standard
// transform parses that into the typed payload variants and stamps the
// processing metadata.
//
// The open metadata map uses `serde_json::Value` so adapters and sinks can
// attach annotations without schema churn; the reserved keys live in [`meta`].
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;
use crate::types::{MessageKind, TradeSide};

/// Reserved metadata keys. Everything else in the map passes through intact.
pub mod meta {
    pub const SOURCE: &str = "source";
    pub const PROCESSED_AT: &str = "processed_at";
    pub const LATENCY: &str = "latency";
    pub const QUALITY_SCORE: &str = "quality_score";
    pub const PROCESSING_VERSION: &str = "processing_version";
    pub const COMPRESSED: &str = "compressed";
    pub const COMPRESSION_RATIO: &str = "compression_ratio";
    pub const ORIGINAL_SIZE: &str = "_original_size";
    pub const INTERVAL: &str = "interval";
    pub const CACHED_AT: &str = "cached_at";
    pub const BATCHED_BY: &str = "batchedBy";
    pub const BATCH_SIZE: &str = "batchSize";
    pub const CHANNEL_ID: &str = "channelId";
    pub const CHANNEL_TYPE: &str = "channelType";
    pub const ROUTED_BY: &str = "routedBy";
}

/// Stamped into `metadata.source` by the standard transform.
pub const SOURCE_NAME: &str = "exchange-collector";
/// Stamped into `metadata.processing_version` by the standard transform.
pub const PROCESSING_VERSION: &str = "2.1";

/// Current wall clock in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// One price level: `[price, quantity]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel(pub f64, pub f64);

impl BookLevel {
    pub fn price(&self) -> f64 {
        self.0
    }

    pub fn quantity(&self) -> f64 {
        self.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub price: f64,
    pub quantity: f64,
    pub side: TradeSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerData {
    pub last: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthData {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl DepthData {
    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineData {
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_time: i64,
    pub close_time: i64,
    #[serde(default)]
    pub closed: bool,
}

/// Tagged payload. `Raw` holds pre-transform adapter output; the standard
/// transform replaces it with the matching typed variant or rejects the
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    Trade(TradeData),
    Ticker(TickerData),
    Depth(DepthData),
    Kline(KlineData),
    Raw(Value),
}

impl MessagePayload {
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

// ---------------------------------------------------------------------------
// MarketMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMessage {
    /// Lowercased exchange identifier (normalized by the standard transform).
    pub exchange: String,
    /// Uppercased symbol (normalized by the standard transform).
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Event time, ms since epoch.
    pub timestamp: i64,
    /// Ingress time at the adapter, ms since epoch.
    pub received_at: i64,
    pub data: MessagePayload,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl MarketMessage {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        kind: MessageKind,
        data: MessagePayload,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            kind,
            timestamp: now_ms(),
            received_at: now_ms(),
            data,
            metadata: HashMap::new(),
        }
    }

    /// Build a pre-transform message from an adapter frame. The stream token
    /// is canonicalized through [`MessageKind::from_token`]; unknown tokens
    /// are a validation error.
    pub fn from_raw(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        token: &str,
        data: Value,
    ) -> Result<Self, FlowError> {
        let (kind, interval) = MessageKind::from_token(token)
            .ok_or_else(|| FlowError::validation(format!("unknown message type `{token}`")))?;

        let mut msg = Self::new(exchange, symbol, kind, MessagePayload::Raw(data));
        msg.timestamp = 0; // filled in from the payload by the transform
        if let Some(interval) = interval {
            msg.set_meta(meta::INTERVAL, Value::String(interval));
        }
        Ok(msg)
    }

    /// `exchange:symbol:kind` — the routing/ordering/caching identity.
    pub fn identity(&self) -> String {
        format!("{}:{}:{}", self.exchange, self.symbol, self.kind)
    }

    // ── Metadata helpers ────────────────────────────────────────────────

    pub fn set_meta(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    /// Kline interval, when one is known (typed payload first, metadata as
    /// the pre-transform fallback).
    pub fn interval(&self) -> Option<&str> {
        match &self.data {
            MessagePayload::Kline(k) => Some(k.interval.as_str()),
            _ => self.meta_str(meta::INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_format() {
        let msg = MarketMessage::new(
            "binance",
            "BTCUSDT",
            MessageKind::Trade,
            MessagePayload::Trade(TradeData {
                price: 50_000.0,
                quantity: 0.5,
                side: TradeSide::Buy,
                trade_id: None,
            }),
        );
        assert_eq!(msg.identity(), "binance:BTCUSDT:trade");
    }

    #[test]
    fn from_raw_rejects_unknown_token() {
        let err = MarketMessage::from_raw("binance", "BTCUSDT", "liquidation", Value::Null)
            .unwrap_err();
        assert_eq!(err.class(), "validation");
    }

    #[test]
    fn from_raw_preserves_kline_interval() {
        let msg = MarketMessage::from_raw(
            "binance",
            "BTCUSDT",
            "kline_15m",
            serde_json::json!({"open": "100"}),
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::Kline);
        assert_eq!(msg.interval(), Some("15m"));
        assert!(msg.data.is_raw());
    }

    #[test]
    fn book_level_serializes_as_pair() {
        let level = BookLevel(100.5, 2.0);
        assert_eq!(
            serde_json::to_value(level).unwrap(),
            serde_json::json!([100.5, 2.0])
        );
    }

    #[test]
    fn message_serializes_with_type_tag() {
        let msg = MarketMessage::new(
            "kraken",
            "ETHUSD",
            MessageKind::Ticker,
            MessagePayload::Ticker(TickerData {
                last: 3000.0,
                bid: Some(2999.5),
                ask: Some(3000.5),
                high_24h: None,
                low_24h: None,
                volume_24h: None,
            }),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ticker");
        assert_eq!(value["exchange"], "kraken");
        assert_eq!(value["data"]["last"], 3000.0);
    }
}
