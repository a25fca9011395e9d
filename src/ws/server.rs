// =============================================================================
// WebSocket endpoint — /ws
// =============================================================================
//
// Each accepted socket gets a pool entry plus a dedicated writer task; the
// handler's receive loop is the only mutator of that connection's
// subscription set. The writer drains the connection's outbound channel, so
// frame order matches enqueue order regardless of who broadcasts.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::CollectorState;
use crate::types::ConnState;
use crate::ws::pool::{Outbound, PooledConnection};
use crate::ws::protocol::{self, ClientMessage};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<CollectorState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<CollectorState>) {
    let id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Outbound>();

    let conn = match state.pool.add(&id, outbound_tx, HashMap::new()) {
        Some(conn) => conn,
        None => {
            let frame = protocol::error("pool_full", "server at connection capacity");
            let _ = sender.send(Message::Text(frame.to_string())).await;
            let _ = sender.close().await;
            return;
        }
    };

    // ── Writer task: sole owner of the socket sender ────────────────────
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let result = match out {
                Outbound::Text(text) => sender.send(Message::Text(text)).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new())).await,
                Outbound::Close => {
                    let _ = sender.close().await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!(id = %writer_id, error = %e, "socket write failed");
                break;
            }
        }
    });

    state.pool.mark_open(&id);
    let _ = conn.send_text(protocol::welcome(&id).to_string());
    info!(id = %id, "websocket client connected");

    // ── Receive loop ────────────────────────────────────────────────────
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                conn.touch();
                handle_client_message(&text, &conn, &state);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                conn.touch();
            }
            Ok(Message::Binary(_)) => {
                debug!(id = %id, "binary frame ignored");
            }
            Ok(Message::Close(_)) => {
                info!(id = %id, "close frame received");
                break;
            }
            Err(e) => {
                warn!(id = %id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    state.pool.remove(&id, ConnState::Closed);
    drop(conn);
    let _ = writer.await;
    info!(id = %id, "websocket client disconnected");
}

/// Dispatch one parsed client request. Unknown or malformed input earns an
/// error frame, never a disconnect.
fn handle_client_message(text: &str, conn: &Arc<PooledConnection>, state: &Arc<CollectorState>) {
    let request: ClientMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(id = %conn.id, error = %e, "unparseable client message");
            let _ = conn.send_text(protocol::error("bad_message", &e.to_string()).to_string());
            return;
        }
    };

    let reply = match request {
        ClientMessage::Ping => protocol::pong(),
        ClientMessage::Subscribe { payload } => {
            let channels = payload.channels();
            for channel in &channels {
                conn.subscribe(channel);
            }
            debug!(id = %conn.id, ?channels, "subscribed");
            protocol::subscribed(&channels)
        }
        ClientMessage::Unsubscribe { payload } => {
            let channels = payload.channels();
            for channel in &channels {
                conn.unsubscribe(channel);
            }
            debug!(id = %conn.id, ?channels, "unsubscribed");
            protocol::unsubscribed(&channels)
        }
        ClientMessage::GetStats => protocol::stats(&conn.stats()),
        ClientMessage::GetSystemStats => protocol::system_stats(
            &state.engine.snapshot(),
            &state.pool.stats(),
            state.monitor.current_score(),
        ),
        ClientMessage::RequestSnapshot { payload } => {
            let messages = state.cache.snapshot_for(&payload.exchange, &payload.symbols);
            protocol::snapshot(&payload.exchange, &messages)
        }
    };

    let _ = conn.send_text(reply.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MarketCache;
    use crate::engine::DataFlowEngine;
    use crate::events::EventBus;
    use crate::monitor::Monitor;
    use crate::runtime_config::RuntimeConfig;
    use crate::testing::trade_message;
    use crate::ws::ConnectionPool;
    use serde_json::Value;

    fn test_state() -> Arc<CollectorState> {
        let config = RuntimeConfig::default();
        let engine = DataFlowEngine::new(config.clone());
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let cache = Arc::new(MarketCache::new(60_000));
        let monitor = Arc::new(Monitor::new(
            config.score_weights.clone(),
            config.performance_baseline.clone(),
            EventBus::default(),
        ));
        Arc::new(CollectorState::new(config, engine, pool, cache, monitor))
    }

    fn connected(
        state: &Arc<CollectorState>,
    ) -> (
        Arc<PooledConnection>,
        tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = state.pool.add("c-test", tx, HashMap::new()).unwrap();
        state.pool.mark_open("c-test");
        (conn, rx)
    }

    fn replies(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Text(text) = out {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    #[tokio::test]
    async fn ping_pong() {
        let state = test_state();
        let (conn, mut rx) = connected(&state);

        handle_client_message(r#"{"type": "ping"}"#, &conn, &state);
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "pong");
        assert!(frames[0]["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn subscribe_updates_connection_state() {
        let state = test_state();
        let (conn, mut rx) = connected(&state);

        handle_client_message(
            r#"{"type": "subscribe", "payload": {"channels": ["marketData", "alerts"]}}"#,
            &conn,
            &state,
        );
        assert!(conn.is_subscribed("marketData"));
        assert!(conn.is_subscribed("alerts"));
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "subscribed");

        handle_client_message(
            r#"{"type": "unsubscribe", "payload": {"channel": "alerts"}}"#,
            &conn,
            &state,
        );
        assert!(!conn.is_subscribed("alerts"));
        assert!(conn.is_subscribed("marketData"));
        assert_eq!(replies(&mut rx)[0]["type"], "unsubscribed");
    }

    #[tokio::test]
    async fn get_stats_reports_connection() {
        let state = test_state();
        let (conn, mut rx) = connected(&state);
        conn.subscribe("marketData");

        handle_client_message(r#"{"type": "getStats"}"#, &conn, &state);
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "stats");
        assert_eq!(frames[0]["payload"]["id"], "c-test");
        assert_eq!(frames[0]["payload"]["subscriptions"][0], "marketData");
    }

    #[tokio::test]
    async fn system_stats_includes_engine_and_pool() {
        let state = test_state();
        let (conn, mut rx) = connected(&state);

        handle_client_message(r#"{"type": "getSystemStats"}"#, &conn, &state);
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "systemStats");
        assert!(frames[0]["payload"]["engine"]["total_processed"].is_number());
        assert_eq!(frames[0]["payload"]["pool"]["connections"], 1);
        assert!(frames[0]["payload"]["performanceScore"].is_number());
    }

    #[tokio::test]
    async fn snapshot_request_reads_the_cache() {
        let state = test_state();
        let msg = trade_message("binance", "BTCUSDT");
        state.cache.put(msg.identity(), msg);
        let (conn, mut rx) = connected(&state);

        handle_client_message(
            r#"{"type": "requestSnapshot", "payload": {"exchange": "binance", "symbols": ["BTCUSDT"]}}"#,
            &conn,
            &state,
        );
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "snapshot");
        assert_eq!(frames[0]["payload"]["count"], 1);
        assert_eq!(frames[0]["payload"]["messages"][0]["symbol"], "BTCUSDT");
    }

    #[tokio::test]
    async fn malformed_message_earns_error_frame() {
        let state = test_state();
        let (conn, mut rx) = connected(&state);

        handle_client_message(r#"{"type": "selfDestruct"}"#, &conn, &state);
        let frames = replies(&mut rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["payload"]["code"], "bad_message");
    }
}
