// =============================================================================
// Transformer chain
// =============================================================================
//
// Transforms run in order inside the engine workers. Each step either rewrites
// the message or rejects it with a validation error; a rejection drops the
// message before routing.
// =============================================================================

pub mod compression;
pub mod standard;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::error::FlowError;
use crate::model::{now_ms, MarketMessage};

pub use compression::CompressionTransform;
pub use standard::StandardTransform;

/// One step of the chain.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite or reject the message.
    fn apply(&self, msg: MarketMessage) -> Result<MarketMessage, FlowError>;

    fn stats(&self) -> TransformStats;
}

/// Snapshot of a transform's counters.
#[derive(Debug, Clone, Serialize)]
pub struct TransformStats {
    pub name: &'static str,
    pub transformed: u64,
    pub errors: u64,
    pub avg_latency_us: u64,
    /// Wall-clock ms of the last apply, 0 when never used.
    pub last_activity_ms: i64,
}

/// Shared counter block kept by every transform.
#[derive(Debug, Default)]
pub struct TransformCounters {
    transformed: AtomicU64,
    errors: AtomicU64,
    total_latency_us: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl TransformCounters {
    pub fn record_ok(&self, started: Instant) {
        self.transformed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_err(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &'static str) -> TransformStats {
        let transformed = self.transformed.load(Ordering::Relaxed);
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        TransformStats {
            name,
            transformed,
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_us: if transformed > 0 {
                total_us / transformed
            } else {
                0
            },
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

/// Ordered chain of transforms.
pub struct TransformChain {
    steps: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new(steps: Vec<Box<dyn Transform>>) -> Self {
        Self { steps }
    }

    /// The default pipeline: standardize, then compress oversized depth.
    pub fn standard(soft_latency_ms: i64) -> Self {
        Self::new(vec![
            Box::new(StandardTransform::new(soft_latency_ms)),
            Box::new(CompressionTransform::default()),
        ])
    }

    pub fn apply(&self, mut msg: MarketMessage) -> Result<MarketMessage, FlowError> {
        for step in &self.steps {
            msg = step.apply(msg)?;
        }
        Ok(msg)
    }

    pub fn stats(&self) -> Vec<TransformStats> {
        self.steps.iter().map(|s| s.stats()).collect()
    }
}
