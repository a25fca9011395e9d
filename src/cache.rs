// =============================================================================
// MarketCache — last-write-wins keyed store with TTL sweep
// =============================================================================
//
// The cache layer owns expiry: sinks write unconditionally per key and a
// periodic sweep evicts entries older than the TTL. Snapshot reads back the
// freshest message per `(exchange, symbol, kind)` for WebSocket clients.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::model::{now_ms, MarketMessage};

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub message: MarketMessage,
    pub cached_at: i64,
}

pub struct MarketCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
    ttl_ms: i64,
}

impl MarketCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_ms: ttl_ms as i64,
        }
    }

    /// Insert or replace the entry for `key`. Last write wins.
    pub fn put(&self, key: String, message: MarketMessage) {
        let entry = CachedEntry {
            message,
            cached_at: now_ms(),
        };
        self.entries.write().insert(key, entry);
    }

    pub fn get(&self, key: &str) -> Option<CachedEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Freshest messages for one exchange, optionally filtered to a symbol
    /// list. Used by snapshot requests over the WebSocket API.
    pub fn snapshot_for(&self, exchange: &str, symbols: &[String]) -> Vec<MarketMessage> {
        let exchange = exchange.to_lowercase();
        let entries = self.entries.read();
        let mut messages: Vec<MarketMessage> = entries
            .values()
            .filter(|e| e.message.exchange == exchange)
            .filter(|e| {
                symbols.is_empty()
                    || symbols
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(&e.message.symbol))
            })
            .map(|e| e.message.clone())
            .collect();
        // Deterministic output order for clients.
        messages.sort_by(|a, b| a.identity().cmp(&b.identity()));
        messages
    }

    /// Drop entries older than the TTL. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let cutoff = now_ms() - self.ttl_ms;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.cached_at >= cutoff);
        before - entries.len()
    }
}

/// Periodic sweep loop; spawned from main.
pub async fn run_sweeper(cache: Arc<MarketCache>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    loop {
        interval.tick().await;
        let evicted = cache.sweep();
        if evicted > 0 {
            debug!(evicted, remaining = cache.len(), "cache sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessagePayload;
    use crate::types::MessageKind;
    use serde_json::Value;

    fn message(exchange: &str, symbol: &str) -> MarketMessage {
        MarketMessage::new(
            exchange,
            symbol,
            MessageKind::Ticker,
            MessagePayload::Raw(Value::Null),
        )
    }

    #[test]
    fn last_write_wins() {
        let cache = MarketCache::new(60_000);
        let mut first = message("binance", "BTCUSDT");
        first.timestamp = 1;
        let mut second = message("binance", "BTCUSDT");
        second.timestamp = 2;

        cache.put(first.identity(), first.clone());
        cache.put(second.identity(), second.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&second.identity()).unwrap().message.timestamp, 2);
    }

    #[test]
    fn snapshot_filters_by_exchange_and_symbol() {
        let cache = MarketCache::new(60_000);
        for (ex, sym) in [
            ("binance", "BTCUSDT"),
            ("binance", "ETHUSDT"),
            ("kraken", "BTCUSD"),
        ] {
            let msg = message(ex, sym);
            cache.put(msg.identity(), msg);
        }

        let all_binance = cache.snapshot_for("binance", &[]);
        assert_eq!(all_binance.len(), 2);

        let btc_only = cache.snapshot_for("binance", &["btcusdt".to_string()]);
        assert_eq!(btc_only.len(), 1);
        assert_eq!(btc_only[0].symbol, "BTCUSDT");

        assert!(cache.snapshot_for("coinbase", &[]).is_empty());
    }

    #[test]
    fn sweep_evicts_expired() {
        let cache = MarketCache::new(0);
        let msg = message("binance", "BTCUSDT");
        cache.put(msg.identity(), msg);
        // TTL of zero: everything older than "now" goes.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }
}
