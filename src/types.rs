// =============================================================================
// Shared types used across the marketflow collector
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical message categories flowing through the engine.
///
/// Adapters deliver a zoo of exchange-specific tokens; [`MessageKind::from_token`]
/// maps them onto these four. Kline intervals are carried on the payload so
/// that every `kline_*` stream collapses onto [`MessageKind::Kline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Trade,
    Ticker,
    Depth,
    Kline,
}

impl MessageKind {
    /// Canonicalize an adapter-specific stream token.
    ///
    /// Returns the kind plus the kline interval when the token carries one
    /// (`kline_1m` → `(Kline, Some("1m"))`). Unknown tokens return `None` and
    /// are rejected by the standard transform.
    pub fn from_token(token: &str) -> Option<(Self, Option<String>)> {
        match token {
            "trade" | "trades" | "aggTrade" => Some((Self::Trade, None)),
            "ticker" | "24hrTicker" => Some((Self::Ticker, None)),
            "depth" | "orderbook" | "partialBookDepth" | "depthUpdate" => {
                Some((Self::Depth, None))
            }
            "kline" => Some((Self::Kline, None)),
            other => {
                let interval = other.strip_prefix("kline_")?;
                if interval.is_empty() {
                    Some((Self::Kline, None))
                } else {
                    Some((Self::Kline, Some(interval.to_string())))
                }
            }
        }
    }

    /// Canonical lowercase name, also used as the topic family segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Ticker => "ticker",
            Self::Depth => "depth",
            Self::Kline => "kline",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "b" => Some(Self::Buy),
            "sell" | "s" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink health derived from the recent error ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SinkHealth {
    /// Classify from the error ratio over recent writes.
    pub fn from_error_ratio(ratio: f64) -> Self {
        if ratio > 0.5 {
            Self::Unhealthy
        } else if ratio > 0.01 {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for SinkHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a pooled WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
