// =============================================================================
// Typed event bus
// =============================================================================
//
// Replaces a string-keyed emitter with one enum over a tokio broadcast
// channel. Subscribers that lag simply miss events (broadcast semantics);
// nothing in the pipeline ever blocks on a listener.
// =============================================================================

use tokio::sync::broadcast;

use crate::engine::StatsSnapshot;
use crate::monitor::Alert;

/// Everything observable about the collector, as typed variants.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Ingress depth crossed the backpressure threshold upward.
    BackpressureActivated { depth: usize },
    /// Ingress depth fell below half the threshold after an activation.
    BackpressureDeactivated { depth: usize },
    /// Periodic stats emission (`monitoring.metrics_interval`).
    StatsUpdated(StatsSnapshot),
    /// A rule's match predicate misbehaved; the rule was skipped.
    RoutingError {
        rule_id: String,
        reason: String,
        identity: String,
    },
    /// A sink write failed for one message.
    SinkError {
        sink_id: String,
        reason: String,
        identity: String,
    },
    AlertCreated(Alert),
    AlertResolved(Alert),
}

impl EngineEvent {
    /// Stable name matching the public event vocabulary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BackpressureActivated { .. } => "backpressureActivated",
            Self::BackpressureDeactivated { .. } => "backpressureDeactivated",
            Self::StatsUpdated(_) => "statsUpdated",
            Self::RoutingError { .. } => "routingError",
            Self::SinkError { .. } => "sinkError",
            Self::AlertCreated(_) => "alertCreated",
            Self::AlertResolved(_) => "alertResolved",
        }
    }
}

/// Shared broadcast bus. Cloning is cheap; every subsystem that emits holds
/// a clone of the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers. Send errors mean nobody is listening,
    /// which is fine.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
