// =============================================================================
// Binance adapter — combined-stream ingestion
// =============================================================================
//
// Subscribes one combined WebSocket stream per adapter covering aggTrade,
// ticker, partial depth and 1m klines for every configured symbol, and turns
// each frame into a raw `MarketMessage` for the engine. A REST depth snapshot
// seeds the cache before the stream catches up.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::{AdapterStatus, ExchangeAdapter};
use crate::model::{now_ms, MarketMessage};

const STREAM_BASE: &str = "wss://stream.binance.com:9443/stream";
const REST_BASE: &str = "https://api.binance.com";

pub struct BinanceAdapter {
    symbols: Vec<String>,
    status: RwLock<AdapterStatus>,
    shutdown: AtomicBool,
}

impl BinanceAdapter {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            status: RwLock::new(AdapterStatus::Disconnected),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Combined-stream URL covering every symbol and stream kind.
    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                [
                    format!("{lower}@aggTrade"),
                    format!("{lower}@ticker"),
                    format!("{lower}@depth20@100ms"),
                    format!("{lower}@kline_1m"),
                ]
            })
            .collect();
        format!("{STREAM_BASE}?streams={}", streams.join("/"))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> &str {
        "binance"
    }

    fn status(&self) -> AdapterStatus {
        *self.status.read()
    }

    async fn run(&self, out: mpsc::UnboundedSender<MarketMessage>) -> Result<()> {
        let url = self.stream_url();
        *self.status.write() = AdapterStatus::Connecting;
        info!(url = %url, symbols = ?self.symbols, "connecting to binance combined stream");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to binance stream")?;
        *self.status.write() = AdapterStatus::Connected;
        info!("binance stream connected");

        let (_write, mut read) = ws_stream.split();

        while !self.shutdown.load(Ordering::Relaxed) {
            match read.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_combined_frame(&text) {
                        Ok(Some(msg)) => {
                            if out.send(msg).is_err() {
                                // Engine side gone; nothing left to feed.
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse stream frame"),
                    }
                }
                Some(Ok(tokio_tungstenite::tungstenite::Message::Ping(_))) => {
                    // tungstenite answers pings on flush; nothing to do.
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    *self.status.write() = AdapterStatus::Error;
                    return Err(e).context("binance stream read error");
                }
                None => {
                    warn!("binance stream ended");
                    break;
                }
            }
        }

        *self.status.write() = AdapterStatus::Disconnected;
        Ok(())
    }

    fn disconnect(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_disconnect_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Parse one combined-stream frame into a raw message.
///
/// Combined frames look like `{"stream": "btcusdt@aggTrade", "data": {...}}`.
/// The event token comes from `data.e` when present; partial depth frames
/// have no event field and are recognized by their book sides.
fn parse_combined_frame(text: &str) -> Result<Option<MarketMessage>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    let stream = match root.get("stream").and_then(|v| v.as_str()) {
        Some(stream) => stream,
        // Subscription acks and other control frames.
        None => return Ok(None),
    };
    let data = root
        .get("data")
        .cloned()
        .context("stream frame missing data")?;

    let symbol = data
        .get("s")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| stream.split('@').next().map(str::to_uppercase))
        .context("stream frame missing symbol")?;

    let token = match data.get("e").and_then(|v| v.as_str()) {
        Some("aggTrade") => "aggTrade".to_string(),
        Some("24hrTicker") => "24hrTicker".to_string(),
        Some("depthUpdate") => "depthUpdate".to_string(),
        Some("kline") => {
            let interval = data
                .pointer("/k/i")
                .and_then(|v| v.as_str())
                .unwrap_or("1m");
            format!("kline_{interval}")
        }
        Some(other) => {
            debug!(event = other, "ignoring unsupported stream event");
            return Ok(None);
        }
        // Partial book depth frames carry no event type.
        None if data.get("bids").is_some() && data.get("asks").is_some() => {
            "partialBookDepth".to_string()
        }
        None => return Ok(None),
    };

    let mut msg = MarketMessage::from_raw("binance", symbol, &token, data)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    msg.received_at = now_ms();
    Ok(Some(msg))
}

/// REST bootstrap: one depth snapshot per symbol, submitted ahead of the
/// stream so snapshot requests have data immediately.
pub async fn fetch_depth_snapshot(client: &reqwest::Client, symbol: &str) -> Result<MarketMessage> {
    let url = format!("{REST_BASE}/api/v3/depth");
    let body: serde_json::Value = client
        .get(&url)
        .query(&[("symbol", symbol), ("limit", "100")])
        .send()
        .await
        .context("depth snapshot request failed")?
        .error_for_status()
        .context("depth snapshot returned an error status")?
        .json()
        .await
        .context("failed to parse depth snapshot body")?;

    let mut msg = MarketMessage::from_raw("binance", symbol, "partialBookDepth", body)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    msg.timestamp = now_ms();
    msg.received_at = now_ms();
    Ok(msg)
}
