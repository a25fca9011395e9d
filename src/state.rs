// =============================================================================
// CollectorState — ties the subsystems together for the API layer
// =============================================================================
//
// Handlers get one `Arc<CollectorState>`; everything inside manages its own
// interior mutability, so the struct itself is plain shared references.
// =============================================================================

use std::sync::Arc;

use crate::cache::MarketCache;
use crate::engine::DataFlowEngine;
use crate::monitor::{HealthReport, Monitor};
use crate::runtime_config::RuntimeConfig;
use crate::ws::ConnectionPool;

pub struct CollectorState {
    pub config: RuntimeConfig,
    pub engine: Arc<DataFlowEngine>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<MarketCache>,
    pub monitor: Arc<Monitor>,
    pub start_time: std::time::Instant,
}

impl CollectorState {
    pub fn new(
        config: RuntimeConfig,
        engine: Arc<DataFlowEngine>,
        pool: Arc<ConnectionPool>,
        cache: Arc<MarketCache>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            config,
            engine,
            pool,
            cache,
            monitor,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn health(&self) -> HealthReport {
        self.monitor.health_check(
            &self.engine.snapshot(),
            &self.pool.stats(),
            self.config.alert_thresholds.channel_error_threshold,
        )
    }
}
