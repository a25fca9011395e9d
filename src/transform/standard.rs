// =============================================================================
// StandardTransform — field normalization, validation, quality scoring
// =============================================================================
//
// The first chain step. Lowercases the exchange, uppercases the symbol, parses
// raw adapter payloads into the typed variants, fills in the event timestamp,
// computes ingress latency and a quality score, and stamps the processing
// metadata. Unknown metadata keys pass through untouched.
// =============================================================================

use std::time::Instant;

use serde_json::{json, Value};

use super::{Transform, TransformCounters, TransformStats};
use crate::error::FlowError;
use crate::model::{
    meta, now_ms, BookLevel, DepthData, KlineData, MarketMessage, MessagePayload, TickerData,
    TradeData, PROCESSING_VERSION, SOURCE_NAME,
};
use crate::types::{MessageKind, TradeSide};

/// Tolerated clock skew when deciding whether `received_at` is sensible.
const RECEIVED_AT_SLACK_MS: i64 = 5_000;

pub struct StandardTransform {
    /// Latency above this starts eating into the quality score.
    soft_latency_ms: i64,
    counters: TransformCounters,
}

impl StandardTransform {
    pub fn new(soft_latency_ms: i64) -> Self {
        Self {
            soft_latency_ms: soft_latency_ms.max(1),
            counters: TransformCounters::default(),
        }
    }

    fn standardize(&self, mut msg: MarketMessage) -> Result<MarketMessage, FlowError> {
        // ── Core field normalization ────────────────────────────────────
        msg.exchange = msg.exchange.trim().to_lowercase();
        msg.symbol = msg.symbol.trim().to_uppercase();

        if msg.exchange.is_empty() {
            return Err(FlowError::validation("missing exchange"));
        }
        if msg.symbol.is_empty() {
            return Err(FlowError::validation("missing symbol"));
        }

        // ── Payload parsing (raw adapter output → typed variant) ────────
        if let MessagePayload::Raw(raw) = &msg.data {
            let raw = raw.clone();
            if msg.timestamp <= 0 {
                if let Some(ts) = extract_timestamp(&raw) {
                    msg.timestamp = ts;
                }
            }
            msg.data = parse_payload(msg.kind, &raw, msg.interval())?;
        }

        if msg.timestamp <= 0 {
            return Err(FlowError::validation("missing or non-positive timestamp"));
        }

        let now = now_ms();
        if msg.received_at <= 0 {
            msg.received_at = now;
        }

        // ── Latency ─────────────────────────────────────────────────────
        let latency = if msg.received_at > 0 && msg.received_at <= now + RECEIVED_AT_SLACK_MS {
            let latency = (now - msg.received_at).max(0);
            msg.set_meta(meta::LATENCY, json!(latency));
            Some(latency)
        } else {
            None
        };

        // ── Payload validation ──────────────────────────────────────────
        validate_payload(&msg.data)?;

        // ── Quality score ───────────────────────────────────────────────
        let score = self.quality_score(&msg, latency);
        msg.set_meta(meta::QUALITY_SCORE, json!(score));

        // ── Processing stamps ───────────────────────────────────────────
        msg.set_meta(meta::PROCESSED_AT, json!(now_ms()));
        msg.set_meta(meta::SOURCE, json!(SOURCE_NAME));
        msg.set_meta(meta::PROCESSING_VERSION, json!(PROCESSING_VERSION));

        Ok(msg)
    }

    /// Start at 1.0; each missing optional field costs 0.15, and latency past
    /// the soft threshold costs up to 0.5 proportionally.
    fn quality_score(&self, msg: &MarketMessage, latency: Option<i64>) -> f64 {
        let missing = match &msg.data {
            MessagePayload::Trade(t) => usize::from(t.trade_id.is_none()),
            MessagePayload::Ticker(t) => {
                usize::from(t.bid.is_none())
                    + usize::from(t.ask.is_none())
                    + usize::from(t.volume_24h.is_none())
            }
            _ => 0,
        };

        let latency_penalty = match latency {
            Some(l) if l > self.soft_latency_ms => {
                let excess = (l - self.soft_latency_ms) as f64 / self.soft_latency_ms as f64;
                excess.min(1.0) * 0.5
            }
            _ => 0.0,
        };

        (1.0 - 0.15 * missing as f64 - latency_penalty).clamp(0.0, 1.0)
    }
}

impl Transform for StandardTransform {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn apply(&self, msg: MarketMessage) -> Result<MarketMessage, FlowError> {
        let started = Instant::now();
        match self.standardize(msg) {
            Ok(msg) => {
                self.counters.record_ok(started);
                Ok(msg)
            }
            Err(e) => {
                self.counters.record_err();
                Err(e)
            }
        }
    }

    fn stats(&self) -> TransformStats {
        self.counters.snapshot("standard")
    }
}

// ---------------------------------------------------------------------------
// Raw payload parsing
// ---------------------------------------------------------------------------

/// Numeric field that may arrive as a JSON number or a numeric string.
fn num(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn field<'a>(raw: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| raw.get(n))
}

fn extract_timestamp(raw: &Value) -> Option<i64> {
    field(raw, &["timestamp", "ts", "T", "E", "time"])
        .and_then(int)
        .filter(|ts| *ts > 0)
}

fn parse_levels(value: &Value) -> Result<Vec<BookLevel>, FlowError> {
    let rows = value
        .as_array()
        .ok_or_else(|| FlowError::validation("depth side is not an array"))?;

    rows.iter()
        .map(|row| {
            let pair = row
                .as_array()
                .filter(|p| p.len() >= 2)
                .ok_or_else(|| FlowError::validation("depth level is not a [price, qty] pair"))?;
            let price = num(&pair[0])
                .ok_or_else(|| FlowError::validation("depth level price is not numeric"))?;
            let qty = num(&pair[1])
                .ok_or_else(|| FlowError::validation("depth level quantity is not numeric"))?;
            Ok(BookLevel(price, qty))
        })
        .collect()
}

fn parse_payload(
    kind: MessageKind,
    raw: &Value,
    interval: Option<&str>,
) -> Result<MessagePayload, FlowError> {
    match kind {
        MessageKind::Trade => {
            let price = field(raw, &["price", "p"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("trade missing price"))?;
            let quantity = field(raw, &["quantity", "qty", "q", "amount"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("trade missing quantity"))?;
            let side = match field(raw, &["side", "S"]).and_then(Value::as_str) {
                Some(s) => TradeSide::parse(s)
                    .ok_or_else(|| FlowError::validation(format!("invalid trade side `{s}`")))?,
                // Binance-style maker flag: buyer-is-maker means the taker sold.
                None => match field(raw, &["m", "is_buyer_maker"]).and_then(Value::as_bool) {
                    Some(true) => TradeSide::Sell,
                    Some(false) => TradeSide::Buy,
                    None => return Err(FlowError::validation("trade missing side")),
                },
            };
            let trade_id = field(raw, &["trade_id", "id", "a", "t"]).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            Ok(MessagePayload::Trade(TradeData {
                price,
                quantity,
                side,
                trade_id,
            }))
        }
        MessageKind::Ticker => {
            let last = field(raw, &["last", "price", "c", "lastPrice"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("ticker missing last price"))?;
            Ok(MessagePayload::Ticker(TickerData {
                last,
                bid: field(raw, &["bid", "b", "bidPrice"]).and_then(num),
                ask: field(raw, &["ask", "a", "askPrice"]).and_then(num),
                high_24h: field(raw, &["high", "h"]).and_then(num),
                low_24h: field(raw, &["low", "l"]).and_then(num),
                volume_24h: field(raw, &["volume", "v"]).and_then(num),
            }))
        }
        MessageKind::Depth => {
            let bids = field(raw, &["bids", "b"])
                .map(parse_levels)
                .transpose()?
                .unwrap_or_default();
            let asks = field(raw, &["asks", "a"])
                .map(parse_levels)
                .transpose()?
                .unwrap_or_default();
            Ok(MessagePayload::Depth(DepthData { bids, asks }))
        }
        MessageKind::Kline => {
            // Binance nests the candle under "k"; flat payloads also accepted.
            let candle = raw.get("k").unwrap_or(raw);
            let open = field(candle, &["open", "o"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("kline missing open"))?;
            let high = field(candle, &["high", "h"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("kline missing high"))?;
            let low = field(candle, &["low", "l"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("kline missing low"))?;
            let close = field(candle, &["close", "c"])
                .and_then(num)
                .ok_or_else(|| FlowError::validation("kline missing close"))?;
            let volume = field(candle, &["volume", "v"]).and_then(num).unwrap_or(0.0);
            let open_time = field(candle, &["open_time", "t"]).and_then(int).unwrap_or(0);
            let close_time = field(candle, &["close_time", "T"]).and_then(int).unwrap_or(0);
            let closed = field(candle, &["closed", "x"])
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let interval = candle
                .get("i")
                .and_then(Value::as_str)
                .or(interval)
                .unwrap_or("1m")
                .to_string();
            Ok(MessagePayload::Kline(KlineData {
                interval,
                open,
                high,
                low,
                close,
                volume,
                open_time,
                close_time,
                closed,
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Payload validation
// ---------------------------------------------------------------------------

fn validate_payload(data: &MessagePayload) -> Result<(), FlowError> {
    match data {
        MessagePayload::Trade(t) => {
            if t.price <= 0.0 || !t.price.is_finite() {
                return Err(FlowError::validation("trade price must be positive"));
            }
            if t.quantity <= 0.0 || !t.quantity.is_finite() {
                return Err(FlowError::validation("trade quantity must be positive"));
            }
            Ok(())
        }
        MessagePayload::Ticker(t) => {
            if t.last <= 0.0 || !t.last.is_finite() {
                return Err(FlowError::validation("ticker last price must be positive"));
            }
            Ok(())
        }
        MessagePayload::Depth(d) => {
            if d.bids.is_empty() && d.asks.is_empty() {
                return Err(FlowError::validation("depth has no levels"));
            }
            for level in d.bids.iter().chain(d.asks.iter()) {
                if level.price() <= 0.0 || level.quantity() <= 0.0 {
                    return Err(FlowError::validation(
                        "depth level price and quantity must be positive",
                    ));
                }
            }
            Ok(())
        }
        MessagePayload::Kline(k) => {
            if k.open <= 0.0 || k.high <= 0.0 || k.low <= 0.0 || k.close <= 0.0 {
                return Err(FlowError::validation("kline prices must be positive"));
            }
            Ok(())
        }
        MessagePayload::Raw(_) => Err(FlowError::validation("payload was not parsed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transform() -> StandardTransform {
        StandardTransform::new(500)
    }

    fn raw_trade() -> MarketMessage {
        let mut msg = MarketMessage::from_raw(
            "  Binance ",
            "btcusdt",
            "trades",
            json!({"price": "50000.5", "quantity": 0.25, "side": "BUY", "trade_id": "t-1",
                   "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        msg.received_at = now_ms();
        msg
    }

    #[test]
    fn normalizes_core_fields() {
        let out = transform().apply(raw_trade()).unwrap();
        assert_eq!(out.exchange, "binance");
        assert_eq!(out.symbol, "BTCUSDT");
        assert_eq!(out.timestamp, 1_700_000_000_000);
        match &out.data {
            MessagePayload::Trade(t) => {
                assert!((t.price - 50_000.5).abs() < f64::EPSILON);
                assert_eq!(t.side, TradeSide::Buy);
                assert_eq!(t.trade_id.as_deref(), Some("t-1"));
            }
            other => panic!("expected trade payload, got {other:?}"),
        }
        assert_eq!(out.meta_str(meta::SOURCE), Some(SOURCE_NAME));
        assert_eq!(out.meta_str(meta::PROCESSING_VERSION), Some(PROCESSING_VERSION));
        assert!(out.meta_f64(meta::QUALITY_SCORE).unwrap() > 0.8);
        assert!(out.meta_f64(meta::LATENCY).is_some());
    }

    #[test]
    fn rejects_non_positive_price() {
        let mut msg = raw_trade();
        msg.data = MessagePayload::Raw(json!({
            "price": "-1", "quantity": 1.0, "side": "buy", "timestamp": 1_700_000_000_000_i64
        }));
        let err = transform().apply(msg).unwrap_err();
        assert_eq!(err.class(), "validation");
    }

    #[test]
    fn rejects_missing_timestamp() {
        let msg = MarketMessage::from_raw(
            "binance",
            "BTCUSDT",
            "trades",
            json!({"price": 1.0, "quantity": 1.0, "side": "buy"}),
        )
        .unwrap();
        let err = transform().apply(msg).unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn maker_flag_maps_to_side() {
        let mut msg = MarketMessage::from_raw(
            "binance",
            "BTCUSDT",
            "aggTrade",
            json!({"p": "100", "q": "2", "m": true, "T": 1_700_000_000_000_i64}),
        )
        .unwrap();
        msg.received_at = now_ms();
        let out = transform().apply(msg).unwrap();
        match &out.data {
            MessagePayload::Trade(t) => assert_eq!(t.side, TradeSide::Sell),
            other => panic!("expected trade payload, got {other:?}"),
        }
    }

    #[test]
    fn depth_levels_accept_numeric_strings() {
        let mut msg = MarketMessage::from_raw(
            "kraken",
            "ethusd",
            "orderbook",
            json!({"bids": [["3000.5", "1.2"]], "asks": [["3001.0", "0.8"]],
                   "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        msg.received_at = now_ms();
        let out = transform().apply(msg).unwrap();
        match &out.data {
            MessagePayload::Depth(d) => {
                assert_eq!(d.bids.len(), 1);
                assert!((d.bids[0].price() - 3000.5).abs() < f64::EPSILON);
            }
            other => panic!("expected depth payload, got {other:?}"),
        }
    }

    #[test]
    fn empty_depth_rejected() {
        let msg = MarketMessage::from_raw(
            "kraken",
            "ethusd",
            "depth",
            json!({"bids": [], "asks": [], "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        let err = transform().apply(msg).unwrap_err();
        assert!(err.to_string().contains("no levels"));
    }

    #[test]
    fn quality_degrades_with_missing_fields_and_latency() {
        // Complete, fresh ticker: high quality.
        let mut fresh = MarketMessage::from_raw(
            "binance",
            "BTCUSDT",
            "24hrTicker",
            json!({"last": 50_000, "bid": 49_999, "ask": 50_001, "volume": 123.0,
                   "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        fresh.received_at = now_ms();
        let fresh = transform().apply(fresh).unwrap();
        assert!(fresh.meta_f64(meta::QUALITY_SCORE).unwrap() > 0.8);

        // Sparse and stale: low quality.
        let mut stale = MarketMessage::from_raw(
            "binance",
            "BTCUSDT",
            "24hrTicker",
            json!({"last": 50_000, "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        stale.received_at = now_ms() - 10_000;
        let stale = transform().apply(stale).unwrap();
        assert!(stale.meta_f64(meta::QUALITY_SCORE).unwrap() < 0.5);
    }

    #[test]
    fn idempotent_on_standardized_message() {
        let once = transform().apply(raw_trade()).unwrap();
        let twice = transform().apply(once.clone()).unwrap();

        assert_eq!(once.exchange, twice.exchange);
        assert_eq!(once.symbol, twice.symbol);
        assert_eq!(once.timestamp, twice.timestamp);
        assert_eq!(once.data, twice.data);

        // Equal metadata bar the per-pass stamps.
        let volatile = [meta::PROCESSED_AT, meta::LATENCY, meta::QUALITY_SCORE];
        for (key, value) in &once.metadata {
            if volatile.contains(&key.as_str()) {
                continue;
            }
            assert_eq!(twice.metadata.get(key), Some(value), "key {key}");
        }
    }

    #[test]
    fn unknown_metadata_preserved() {
        let mut msg = raw_trade();
        msg.set_meta("adapter_shard", json!(7));
        let out = transform().apply(msg).unwrap();
        assert_eq!(out.meta_f64("adapter_shard"), Some(7.0));
    }

    #[test]
    fn counters_advance() {
        let t = transform();
        t.apply(raw_trade()).unwrap();
        let mut bad = raw_trade();
        bad.data = MessagePayload::Raw(json!({"quantity": 1.0}));
        t.apply(bad).unwrap_err();

        let stats = t.stats();
        assert_eq!(stats.transformed, 1);
        assert_eq!(stats.errors, 1);
        assert!(stats.last_activity_ms > 0);
    }
}
