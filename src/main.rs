// =============================================================================
// marketflow — market-data collector & fan-out service
// =============================================================================
//
// Upstream exchange streams feed the DataFlow engine; routing rules fan each
// message out to the broker publish sink, the WebSocket broadcast sink, and
// the in-memory cache. The monitor scores performance and raises alerts.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod cache;
mod engine;
mod error;
mod events;
mod model;
mod monitor;
mod routing;
mod runtime_config;
mod sink;
mod state;
#[cfg(test)]
mod testing;
mod transform;
mod types;
mod upstream;
mod ws;

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::MarketCache;
use crate::engine::DataFlowEngine;
use crate::error::FlowError;
use crate::monitor::Monitor;
use crate::routing::RoutingRule;
use crate::runtime_config::RuntimeConfig;
use crate::sink::{CacheSink, LogBroker, PublishSink, Sink, WebSocketSink};
use crate::state::CollectorState;
use crate::upstream::{BinanceAdapter, ExchangeAdapter};
use crate::ws::ConnectionPool;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("marketflow collector starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MARKETFLOW_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    info!(symbols = ?config.symbols, batching = config.batching.enabled, "configured");

    // ── 2. Core subsystems ───────────────────────────────────────────────
    let cache = Arc::new(MarketCache::new(config.cache.ttl_ms));
    let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
    let engine = DataFlowEngine::new(config.clone());

    // ── 3. Sinks & routing ───────────────────────────────────────────────
    let broker = Arc::new(LogBroker::default());
    engine.register_sink(Arc::new(PublishSink::new(
        "publish-main",
        config.publish.topic_prefix.clone(),
        broker,
    )) as Arc<dyn Sink>);
    engine.register_sink(Arc::new(WebSocketSink::new(
        "ws-main",
        "marketData",
        pool.clone(),
    )) as Arc<dyn Sink>);
    engine.register_sink(Arc::new(CacheSink::new("cache-main", cache.clone())) as Arc<dyn Sink>);

    engine.add_routing_rule(RoutingRule::catch_all(
        "fan-out",
        vec!["publish-main", "ws-main", "cache-main"],
    ));

    // ── 4. Monitor ───────────────────────────────────────────────────────
    let monitor = Arc::new(
        Monitor::new(
            config.score_weights.clone(),
            config.performance_baseline.clone(),
            engine.events().clone(),
        )
        .with_default_rules(&config.alert_thresholds),
    );

    // ── 5. Start the engine & maintenance loops ──────────────────────────
    engine.start()?;

    tokio::spawn(cache::run_sweeper(cache.clone(), config.cache.sweep_interval_ms));
    tokio::spawn(ws::pool::run_heartbeat(pool.clone()));
    if config.pool.enable_batching {
        tokio::spawn(ws::pool::run_flusher(pool.clone()));
    }
    tokio::spawn(monitor::run_monitor(
        monitor.clone(),
        engine.clone(),
        pool.clone(),
    ));

    // ── 6. Upstream ingestion ────────────────────────────────────────────
    let (upstream_tx, mut upstream_rx) = tokio::sync::mpsc::unbounded_channel();

    let pump_engine = engine.clone();
    tokio::spawn(async move {
        while let Some(msg) = upstream_rx.recv().await {
            match pump_engine.submit(msg) {
                Ok(()) => {}
                Err(FlowError::Backpressure { depth, .. }) => {
                    debug!(depth, "ingress full, upstream message dropped");
                }
                Err(FlowError::EngineStopped) => break,
                Err(e) => warn!(error = %e, "submit failed"),
            }
        }
    });

    // REST depth snapshots seed the cache before the stream catches up.
    let bootstrap_tx = upstream_tx.clone();
    let bootstrap_symbols = config.symbols.clone();
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        for symbol in &bootstrap_symbols {
            match upstream::binance::fetch_depth_snapshot(&client, symbol).await {
                Ok(msg) => {
                    let _ = bootstrap_tx.send(msg);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "depth bootstrap failed"),
            }
        }
    });

    let adapter = Arc::new(BinanceAdapter::new(config.symbols.clone()));
    let stream_adapter = adapter.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = stream_adapter.run(upstream_tx.clone()).await {
                error!(error = %e, "upstream stream error, reconnecting in 5s");
            }
            if stream_adapter.is_disconnect_requested() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
    });

    // ── 7. API server (/ws + status REST) ────────────────────────────────
    let state = Arc::new(CollectorState::new(
        config.clone(),
        engine.clone(),
        pool.clone(),
        cache.clone(),
        monitor.clone(),
    ));

    let bind_addr =
        std::env::var("MARKETFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, draining");

    adapter.disconnect();
    engine.stop().await;
    pool.close_all();

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("marketflow shut down complete");
    Ok(())
}
