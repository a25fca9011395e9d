// =============================================================================
// Monitor — performance scoring, alert rules, health checks
// =============================================================================
//
// Consumes the engine's periodic statsUpdated events plus pool stats pulls.
// Each ingest turns the raw snapshot into a metric sample (rates computed
// against the previous snapshot), runs the alert rules, and refreshes the
// composite performance score.
//
// Rule semantics: a rule fires after its metric has violated the threshold
// continuously for the rule's duration; critical rules fire on the first
// violation. An alert resolves as soon as the metric returns within
// threshold, moving it to history.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{DataFlowEngine, StatsSnapshot};
use crate::events::{EngineEvent, EventBus};
use crate::model::now_ms;
use crate::runtime_config::{AlertThresholds, PerformanceBaseline, ScoreWeights};
use crate::types::SinkHealth;
use crate::ws::{ConnectionPool, PoolStats};

const MAX_ALERT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Above,
    Below,
    Equal,
    NotEqual,
}

impl AlertCondition {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    /// Metric key in the sample map (see [`Monitor::sample_from`]).
    pub metric: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    /// How long the violation must persist before firing. Ignored for
    /// critical rules.
    pub duration: Duration,
    pub severity: Severity,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        condition: AlertCondition,
        threshold: f64,
        duration: Duration,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            condition,
            threshold,
            duration,
            severity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub rule_id: String,
    pub metric: String,
    pub severity: Severity,
    pub threshold: f64,
    /// Metric value at fire time.
    pub value: f64,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// Metric sample the rules run against.
pub type MetricSample = HashMap<String, f64>;

/// Structured result of a health check. Built, never thrown.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub performance_score: f64,
    pub active_alerts: usize,
    pub queue: QueueHealth,
    pub pool: PoolHealth,
    pub sinks: Vec<SinkHealthEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub connections: usize,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkHealthEntry {
    pub id: String,
    pub health: SinkHealth,
    pub errors: u64,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct Monitor {
    rules: RwLock<Vec<AlertRule>>,
    active: Mutex<HashMap<String, Alert>>,
    history: Mutex<Vec<Alert>>,
    /// First-violation instant per rule id.
    violations: Mutex<HashMap<String, Instant>>,
    /// Totals from the previous snapshot, for windowed rates.
    prev_totals: Mutex<Option<(u64, u64)>>,
    weights: ScoreWeights,
    baseline: PerformanceBaseline,
    /// Score scaled by 1000 for atomic storage.
    score_milli: AtomicU64,
    events: EventBus,
}

impl Monitor {
    pub fn new(weights: ScoreWeights, baseline: PerformanceBaseline, events: EventBus) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            violations: Mutex::new(HashMap::new()),
            prev_totals: Mutex::new(None),
            weights,
            baseline,
            score_milli: AtomicU64::new(100_000),
            events,
        }
    }

    /// The standard rule set derived from the configured thresholds.
    pub fn with_default_rules(self, thresholds: &AlertThresholds) -> Self {
        self.add_rule(AlertRule::new(
            "high-error-rate",
            "error_rate",
            AlertCondition::Above,
            thresholds.error_rate_threshold,
            Duration::from_secs(10),
            Severity::Warning,
        ));
        self.add_rule(AlertRule::new(
            "queue-depth",
            "queue_size",
            AlertCondition::Above,
            thresholds.queue_size_threshold as f64,
            Duration::from_secs(5),
            Severity::Warning,
        ));
        self.add_rule(AlertRule::new(
            "high-latency",
            "latency_ms",
            AlertCondition::Above,
            thresholds.latency_threshold_ms as f64,
            Duration::from_secs(10),
            Severity::Warning,
        ));
        self.add_rule(AlertRule::new(
            "channel-errors",
            "pool_send_errors",
            AlertCondition::Above,
            thresholds.channel_error_threshold as f64,
            Duration::ZERO,
            Severity::Critical,
        ));
        self
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().push(rule);
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    // ── Ingest ──────────────────────────────────────────────────────────

    /// Turn an engine snapshot + pool stats into the metric sample the rules
    /// understand.
    pub fn sample_from(&self, snapshot: &StatsSnapshot, pool: &PoolStats) -> MetricSample {
        let (prev_done, prev_errors) = self
            .prev_totals
            .lock()
            .replace((snapshot.total_processed, snapshot.total_errors))
            .unwrap_or((0, 0));
        let window_done = snapshot.total_processed.saturating_sub(prev_done);
        let window_errors = snapshot.total_errors.saturating_sub(prev_errors);
        let error_rate = if window_done + window_errors > 0 {
            window_errors as f64 / (window_done + window_errors) as f64
        } else {
            0.0
        };

        let mut sample = MetricSample::new();
        sample.insert("error_rate".to_string(), error_rate);
        sample.insert("queue_size".to_string(), snapshot.current_queue_size as f64);
        sample.insert(
            "latency_ms".to_string(),
            snapshot.latency_p95_us as f64 / 1_000.0,
        );
        sample.insert("throughput".to_string(), snapshot.messages_per_second);
        sample.insert(
            "pool_send_errors".to_string(),
            pool.recent_send_errors as f64,
        );
        sample.insert("pool_utilization".to_string(), pool.utilization);
        sample
    }

    /// Run the rules and refresh the score. The main monitor entry point.
    pub fn ingest(&self, snapshot: &StatsSnapshot, pool: &PoolStats) {
        let sample = self.sample_from(snapshot, pool);
        self.evaluate(&sample);
        let score = self.performance_score(&sample);
        self.score_milli
            .store((score * 1_000.0) as u64, Ordering::Relaxed);
    }

    /// Check every rule against the sample, firing and resolving alerts.
    pub fn evaluate(&self, sample: &MetricSample) {
        let rules = self.rules.read().clone();
        let now = Instant::now();

        for rule in &rules {
            let value = match sample.get(&rule.metric) {
                Some(value) => *value,
                None => continue,
            };

            if rule.condition.holds(value, rule.threshold) {
                let first = *self
                    .violations
                    .lock()
                    .entry(rule.id.clone())
                    .or_insert(now);
                let sustained = now.duration_since(first) >= rule.duration;
                if rule.severity == Severity::Critical || sustained {
                    self.fire(rule, value);
                }
            } else {
                self.violations.lock().remove(&rule.id);
                self.resolve(&rule.id);
            }
        }
    }

    fn fire(&self, rule: &AlertRule, value: f64) {
        let mut active = self.active.lock();
        if active.contains_key(&rule.id) {
            return;
        }
        let alert = Alert {
            rule_id: rule.id.clone(),
            metric: rule.metric.clone(),
            severity: rule.severity,
            threshold: rule.threshold,
            value,
            created_at: now_ms(),
            resolved_at: None,
        };
        warn!(
            rule = %rule.id,
            metric = %rule.metric,
            value,
            threshold = rule.threshold,
            "alert created"
        );
        active.insert(rule.id.clone(), alert.clone());
        drop(active);
        self.events.emit(EngineEvent::AlertCreated(alert));
    }

    fn resolve(&self, rule_id: &str) {
        let alert = self.active.lock().remove(rule_id);
        if let Some(mut alert) = alert {
            alert.resolved_at = Some(now_ms());
            info!(rule = rule_id, "alert resolved");
            let mut history = self.history.lock();
            history.push(alert.clone());
            if history.len() > MAX_ALERT_HISTORY {
                history.remove(0);
            }
            self.events.emit(EngineEvent::AlertResolved(alert));
        }
    }

    /// Manually clear an alert (and its violation timer, so it can re-fire).
    pub fn resolve_alert(&self, rule_id: &str) -> bool {
        self.violations.lock().remove(rule_id);
        let had = self.active.lock().contains_key(rule_id);
        self.resolve(rule_id);
        had
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.lock().values().cloned().collect();
        alerts.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        alerts
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.history.lock().clone()
    }

    // ── Scoring ─────────────────────────────────────────────────────────

    /// Weighted composite in [0, 100]: latency vs baseline, throughput vs
    /// target, windowed success rate, stability (active alerts).
    pub fn performance_score(&self, sample: &MetricSample) -> f64 {
        let latency_ms = sample.get("latency_ms").copied().unwrap_or(0.0);
        let throughput = sample.get("throughput").copied().unwrap_or(0.0);
        let error_rate = sample.get("error_rate").copied().unwrap_or(0.0);

        let max_latency = self.baseline.max_latency_ms as f64;
        let latency_score = if latency_ms <= max_latency {
            100.0
        } else {
            (max_latency / latency_ms * 100.0).clamp(0.0, 100.0)
        };

        let throughput_score = if self.baseline.min_throughput <= 0.0 {
            100.0
        } else {
            (throughput / self.baseline.min_throughput * 100.0).clamp(0.0, 100.0)
        };

        let success_score = if error_rate <= self.baseline.max_error_rate {
            100.0
        } else {
            (self.baseline.max_error_rate / error_rate * 100.0).clamp(0.0, 100.0)
        };

        let stability_score = (100.0 - 20.0 * self.active.lock().len() as f64).max(0.0);

        let w = &self.weights;
        let total_weight = w.latency + w.throughput + w.success_rate + w.stability;
        if total_weight <= 0.0 {
            return 0.0;
        }
        ((latency_score * w.latency
            + throughput_score * w.throughput
            + success_score * w.success_rate
            + stability_score * w.stability)
            / total_weight)
            .clamp(0.0, 100.0)
    }

    pub fn current_score(&self) -> f64 {
        self.score_milli.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    // ── Health check ────────────────────────────────────────────────────

    /// Status tree over the queue, the pool, and every sink. Always returns.
    pub fn health_check(
        &self,
        snapshot: &StatsSnapshot,
        pool: &PoolStats,
        channel_error_threshold: u64,
    ) -> HealthReport {
        let sinks: Vec<SinkHealthEntry> = snapshot
            .sinks
            .iter()
            .map(|s| SinkHealthEntry {
                id: s.id.clone(),
                health: s.health,
                errors: s.errors,
            })
            .collect();

        let pool_healthy =
            pool.utilization < 0.9 && pool.recent_send_errors < channel_error_threshold;
        let sinks_healthy = sinks.iter().all(|s| s.health != SinkHealth::Unhealthy);
        let active_alerts = self.active.lock().len();

        let status = if pool_healthy && sinks_healthy && active_alerts == 0 {
            "ok"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            performance_score: self.current_score(),
            active_alerts,
            queue: QueueHealth {
                depth: snapshot.current_queue_size,
                dropped: snapshot.total_dropped,
            },
            pool: PoolHealth {
                healthy: pool_healthy,
                connections: pool.connections,
                utilization: pool.utilization,
            },
            sinks,
        }
    }
}

/// Event-driven monitor loop: every statsUpdated ingests a fresh sample.
/// Spawned from main.
pub async fn run_monitor(
    monitor: Arc<Monitor>,
    engine: Arc<DataFlowEngine>,
    pool: Arc<ConnectionPool>,
) {
    let mut events = engine.events().subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::StatsUpdated(snapshot)) => {
                monitor.ingest(&snapshot, &pool.stats());
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "monitor lagged behind the event bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Monitor {
        Monitor::new(
            ScoreWeights::default(),
            PerformanceBaseline::default(),
            EventBus::default(),
        )
    }

    fn sample(pairs: &[(&str, f64)]) -> MetricSample {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn critical_fires_immediately() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "channel-errors",
            "pool_send_errors",
            AlertCondition::Above,
            10.0,
            Duration::from_secs(60),
            Severity::Critical,
        ));

        m.evaluate(&sample(&[("pool_send_errors", 25.0)]));
        let active = m.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "channel-errors");
        assert!((active[0].value - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn warning_requires_sustained_violation() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "queue-depth",
            "queue_size",
            AlertCondition::Above,
            100.0,
            Duration::from_millis(50),
            Severity::Warning,
        ));

        m.evaluate(&sample(&[("queue_size", 500.0)]));
        assert!(m.active_alerts().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        m.evaluate(&sample(&[("queue_size", 500.0)]));
        assert_eq!(m.active_alerts().len(), 1);
    }

    #[test]
    fn recovery_interrupts_the_duration_clock() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "queue-depth",
            "queue_size",
            AlertCondition::Above,
            100.0,
            Duration::from_millis(50),
            Severity::Warning,
        ));

        m.evaluate(&sample(&[("queue_size", 500.0)]));
        std::thread::sleep(Duration::from_millis(60));
        // Metric recovered before the duration elapsed: clock resets.
        m.evaluate(&sample(&[("queue_size", 10.0)]));
        m.evaluate(&sample(&[("queue_size", 500.0)]));
        assert!(m.active_alerts().is_empty());
    }

    #[test]
    fn resolution_moves_alert_to_history() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "errors",
            "error_rate",
            AlertCondition::Above,
            0.1,
            Duration::ZERO,
            Severity::Critical,
        ));

        m.evaluate(&sample(&[("error_rate", 0.5)]));
        assert_eq!(m.active_alerts().len(), 1);

        m.evaluate(&sample(&[("error_rate", 0.0)]));
        assert!(m.active_alerts().is_empty());
        let history = m.alert_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved_at.is_some());
    }

    #[test]
    fn manual_resolve() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "errors",
            "error_rate",
            AlertCondition::Above,
            0.1,
            Duration::ZERO,
            Severity::Critical,
        ));
        m.evaluate(&sample(&[("error_rate", 0.5)]));

        assert!(m.resolve_alert("errors"));
        assert!(m.active_alerts().is_empty());
        assert!(!m.resolve_alert("errors"));
    }

    #[test]
    fn score_is_100_at_baseline() {
        let m = monitor();
        let score = m.performance_score(&sample(&[
            ("latency_ms", 10.0),
            ("throughput", 500.0),
            ("error_rate", 0.0),
        ]));
        assert!((score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_degrades_with_latency_errors_and_alerts() {
        let m = monitor();
        m.add_rule(AlertRule::new(
            "errors",
            "error_rate",
            AlertCondition::Above,
            0.1,
            Duration::ZERO,
            Severity::Critical,
        ));

        let degraded = sample(&[
            ("latency_ms", 1_000.0),
            ("throughput", 10.0),
            ("error_rate", 0.5),
        ]);
        m.evaluate(&degraded); // one active alert now
        let score = m.performance_score(&degraded);
        assert!(score < 50.0);
        assert!(score >= 0.0);
    }

    #[test]
    fn windowed_error_rate_uses_deltas() {
        let m = monitor();
        let pool_stats = crate::ws::PoolStats {
            connections: 0,
            open_connections: 0,
            max_connections: 10,
            utilization: 0.0,
            total_added: 0,
            total_removed: 0,
            broadcasts: 0,
            send_errors: 0,
            recent_send_errors: 0,
            buffered_bytes: 0,
        };
        let snapshot = |processed, errors| StatsSnapshot {
            total_processed: processed,
            total_errors: errors,
            total_dropped: 0,
            total_unrouted: 0,
            validation_errors: 0,
            routing_errors: 0,
            sink_errors: errors,
            current_queue_size: 0,
            messages_per_second: 0.0,
            latency_p50_us: 0,
            latency_p95_us: 0,
            latency_p99_us: 0,
            sinks: Vec::new(),
            transforms: Vec::new(),
        };

        // First window: 90 ok / 10 errors.
        let s1 = m.sample_from(&snapshot(90, 10), &pool_stats);
        assert!((s1["error_rate"] - 0.1).abs() < 1e-9);

        // Second window: 100 more ok, no new errors.
        let s2 = m.sample_from(&snapshot(190, 10), &pool_stats);
        assert!((s2["error_rate"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn health_check_reports_degraded_pool() {
        let m = monitor();
        let pool_stats = crate::ws::PoolStats {
            connections: 95,
            open_connections: 95,
            max_connections: 100,
            utilization: 0.95,
            total_added: 95,
            total_removed: 0,
            broadcasts: 0,
            send_errors: 0,
            recent_send_errors: 0,
            buffered_bytes: 0,
        };
        let snapshot = StatsSnapshot {
            total_processed: 0,
            total_errors: 0,
            total_dropped: 0,
            total_unrouted: 0,
            validation_errors: 0,
            routing_errors: 0,
            sink_errors: 0,
            current_queue_size: 0,
            messages_per_second: 0.0,
            latency_p50_us: 0,
            latency_p95_us: 0,
            latency_p99_us: 0,
            sinks: Vec::new(),
            transforms: Vec::new(),
        };

        let report = m.health_check(&snapshot, &pool_stats, 10);
        assert_eq!(report.status, "degraded");
        assert!(!report.pool.healthy);
    }
}
