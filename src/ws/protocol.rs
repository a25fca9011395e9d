// =============================================================================
// WebSocket wire protocol — client requests and server frames
// =============================================================================
//
// Client → server messages are tag-dispatched on `type`. Server → client
// frames are built as JSON values here so every one carries a numeric
// `timestamp` and the same envelope shape.
// =============================================================================

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::StatsSnapshot;
use crate::model::{now_ms, MarketMessage};
use crate::ws::pool::{ConnectionStats, PoolStats};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Channel list payload accepted as either `{channel}` or `{channels: [...]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelPayload {
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl ChannelPayload {
    pub fn channels(&self) -> Vec<String> {
        let mut channels = self.channels.clone();
        if let Some(channel) = &self.channel {
            if !channels.iter().any(|c| c == channel) {
                channels.insert(0, channel.clone());
            }
        }
        channels
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotRequest {
    pub exchange: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(default)]
        payload: ChannelPayload,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        #[serde(default)]
        payload: ChannelPayload,
    },
    #[serde(rename = "getStats")]
    GetStats,
    #[serde(rename = "getSystemStats")]
    GetSystemStats,
    #[serde(rename = "requestSnapshot")]
    RequestSnapshot { payload: SnapshotRequest },
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

pub fn welcome(connection_id: &str) -> Value {
    json!({
        "type": "welcome",
        "payload": {
            "connectionId": connection_id,
            "serverTime": now_ms(),
        },
        "timestamp": now_ms(),
    })
}

pub fn pong() -> Value {
    json!({"type": "pong", "timestamp": now_ms()})
}

pub fn subscribed(channels: &[String]) -> Value {
    json!({
        "type": "subscribed",
        "payload": {"channels": channels},
        "timestamp": now_ms(),
    })
}

pub fn unsubscribed(channels: &[String]) -> Value {
    json!({
        "type": "unsubscribed",
        "payload": {"channels": channels},
        "timestamp": now_ms(),
    })
}

pub fn stats(stats: &ConnectionStats) -> Value {
    json!({
        "type": "stats",
        "payload": stats,
        "timestamp": now_ms(),
    })
}

pub fn system_stats(engine: &StatsSnapshot, pool: &PoolStats, performance_score: f64) -> Value {
    json!({
        "type": "systemStats",
        "payload": {
            "engine": engine,
            "pool": pool,
            "performanceScore": performance_score,
        },
        "timestamp": now_ms(),
    })
}

pub fn snapshot(exchange: &str, messages: &[MarketMessage]) -> Value {
    json!({
        "type": "snapshot",
        "payload": {
            "exchange": exchange,
            "messages": messages,
            "count": messages.len(),
        },
        "timestamp": now_ms(),
    })
}

pub fn error(code: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "payload": {"code": code, "message": message},
        "timestamp": now_ms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_by_type_tag() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "payload": {"channel": "marketData"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { payload } => {
                assert_eq!(payload.channels(), vec!["marketData"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "unsubscribe", "payload": {"channels": ["a", "b"]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Unsubscribe { payload } => {
                assert_eq!(payload.channels(), vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "requestSnapshot", "payload": {"exchange": "binance", "symbols": ["BTCUSDT"]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::RequestSnapshot { payload } => {
                assert_eq!(payload.exchange, "binance");
                assert_eq!(payload.symbols, vec!["BTCUSDT"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn channel_payload_merges_singular_and_plural() {
        let payload = ChannelPayload {
            channel: Some("x".to_string()),
            channels: vec!["x".to_string(), "y".to_string()],
        };
        assert_eq!(payload.channels(), vec!["x", "y"]);
    }

    #[test]
    fn server_frames_carry_numeric_timestamp() {
        for frame in [welcome("c-1"), pong(), error("bad_message", "nope")] {
            assert!(frame["timestamp"].as_i64().unwrap() > 0);
            assert!(frame["type"].is_string());
        }
        assert_eq!(welcome("c-1")["payload"]["connectionId"], "c-1");
        assert_eq!(error("bad_message", "nope")["payload"]["code"], "bad_message");
    }
}
