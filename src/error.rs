// =============================================================================
// Error taxonomy — tagged, non-fatal per-message errors
// =============================================================================
//
// Everything the engine can report back to a caller or an event listener is
// one of these variants. None of them is allowed to cross the engine boundary
// as a panic; they are returned, counted, and logged with the message identity
// (exchange/symbol/kind — never the full payload at info level).
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A transform rejected the message. Not retried; the message is dropped.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A routing rule's match predicate misbehaved; the rule is skipped for
    /// this message.
    #[error("routing rule {rule_id} failed: {reason}")]
    Routing { rule_id: String, reason: String },

    /// A sink write returned an error. Only that sink drops the message.
    #[error("sink {sink_id} write failed: {reason}")]
    Sink { sink_id: String, reason: String },

    /// The ingress queue is at capacity; the submit was rejected.
    #[error("backpressure rejection: queue depth {depth} at capacity {capacity}")]
    Backpressure { depth: usize, capacity: usize },

    /// Submit after stop.
    #[error("engine stopped")]
    EngineStopped,

    /// A socket write failed; the connection is marked for removal.
    #[error("transport error on connection {connection_id}: {reason}")]
    Transport {
        connection_id: String,
        reason: String,
    },

    /// A sink write exceeded the processing timeout. Recorded, not a crash.
    #[error("sink {sink_id} timed out after {elapsed_ms}ms")]
    Timeout { sink_id: String, elapsed_ms: u64 },
}

impl FlowError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn routing(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Routing {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    pub fn sink(sink_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Sink {
            sink_id: sink_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            connection_id: connection_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable class label used for counters and the error log ring.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Routing { .. } => "routing",
            Self::Sink { .. } => "sink",
            Self::Backpressure { .. } => "backpressure",
            Self::EngineStopped => "stopped",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Whether a retry could plausibly succeed. Validation failures and
    /// submits after stop are terminal; the rest are transient.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::EngineStopped)
    }
}
