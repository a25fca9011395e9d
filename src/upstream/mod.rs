// =============================================================================
// Upstream exchange adapters
// =============================================================================
//
// Adapters own the exchange connection and push raw `MarketMessage`s into the
// engine through a channel; reconnect policy belongs to the caller (main
// spawns one reconnect loop per adapter).
// =============================================================================

pub mod binance;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::MarketMessage;

pub use binance::BinanceAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Lowercased exchange identifier the adapter stamps on its messages.
    fn exchange(&self) -> &str;

    fn status(&self) -> AdapterStatus;

    /// Connect and stream messages into `out` until the connection drops or
    /// [`ExchangeAdapter::disconnect`] is called. Returns so the caller can
    /// decide on reconnection.
    async fn run(&self, out: mpsc::UnboundedSender<MarketMessage>) -> anyhow::Result<()>;

    /// Ask a running adapter to stop after the current frame.
    fn disconnect(&self);

    /// Whether [`ExchangeAdapter::disconnect`] has been requested.
    fn is_disconnect_requested(&self) -> bool;
}
