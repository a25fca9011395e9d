// =============================================================================
// Runtime Configuration — hot-reloadable collector settings with atomic save
// =============================================================================
//
// Every tunable parameter of the collector lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_timeout_ms() -> u64 {
    1_000
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_processing_timeout_ms() -> u64 {
    5_000
}

fn default_backpressure_threshold() -> usize {
    5_000
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_metrics_interval_ms() -> u64 {
    5_000
}

fn default_max_connections() -> usize {
    1_000
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_pool_flush_interval_ms() -> u64 {
    100
}

fn default_pool_batch_size() -> usize {
    25
}

fn default_memory_threshold_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_queue_size_threshold() -> usize {
    8_000
}

fn default_latency_threshold_ms() -> u64 {
    1_000
}

fn default_channel_error_threshold() -> u64 {
    10
}

fn default_baseline_max_latency_ms() -> u64 {
    100
}

fn default_baseline_min_throughput() -> f64 {
    100.0
}

fn default_baseline_max_error_rate() -> f64 {
    0.01
}

fn default_latency_weight() -> f64 {
    0.3
}

fn default_throughput_weight() -> f64 {
    0.25
}

fn default_success_weight() -> f64 {
    0.3
}

fn default_stability_weight() -> f64 {
    0.15
}

fn default_soft_latency_ms() -> i64 {
    500
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_cache_sweep_interval_ms() -> u64 {
    10_000
}

fn default_topic_prefix() -> String {
    "market-data".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Sink-write batching. When enabled, every registered sink is wrapped in a
/// batch decorator at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Flush when the buffer reaches this many messages.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush when the oldest buffered message is this old.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

/// Ingress and worker-pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Hard ingress cap. Submits beyond this are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Bound on end-to-end handling of one message, and on the stop drain.
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Emit threshold events when the ingress depth crosses the soft limit.
    #[serde(default = "default_true")]
    pub enable_backpressure: bool,

    /// Depth at which backpressure activates.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,

    /// Worker count; defaults to the CPU count.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            processing_timeout_ms: default_processing_timeout_ms(),
            enable_backpressure: true,
            backpressure_threshold: default_backpressure_threshold(),
            worker_count: default_worker_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable the periodic stats emission.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Interval between statsUpdated events.
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Maintain latency sample rings for percentile reporting.
    #[serde(default = "default_true")]
    pub enable_latency_tracking: bool,

    /// Soft latency threshold used by the quality score.
    #[serde(default = "default_soft_latency_ms")]
    pub soft_latency_ms: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval_ms: default_metrics_interval_ms(),
            enable_latency_tracking: true,
            soft_latency_ms: default_soft_latency_ms(),
        }
    }
}

/// WebSocket connection pool limits and per-connection batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle connections older than this are removed by the heartbeat task.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Per-connection buffer flush interval when batching is enabled.
    #[serde(default = "default_pool_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default)]
    pub enable_batching: bool,

    /// Per-connection buffer size that forces a flush.
    #[serde(default = "default_pool_batch_size")]
    pub batch_size: usize,

    /// Total buffered outbound bytes above which the watchdog force-flushes
    /// every connection buffer.
    #[serde(default = "default_memory_threshold_bytes")]
    pub memory_threshold_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            flush_interval_ms: default_pool_flush_interval_ms(),
            enable_batching: false,
            batch_size: default_pool_batch_size(),
            memory_threshold_bytes: default_memory_threshold_bytes(),
        }
    }
}

/// Thresholds feeding the monitor's default alert rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_queue_size_threshold")]
    pub queue_size_threshold: usize,

    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    #[serde(default = "default_channel_error_threshold")]
    pub channel_error_threshold: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate_threshold(),
            queue_size_threshold: default_queue_size_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            channel_error_threshold: default_channel_error_threshold(),
        }
    }
}

/// Reference values the performance score is computed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    #[serde(default = "default_baseline_max_latency_ms")]
    pub max_latency_ms: u64,

    #[serde(default = "default_baseline_min_throughput")]
    pub min_throughput: f64,

    #[serde(default = "default_baseline_max_error_rate")]
    pub max_error_rate: f64,
}

impl Default for PerformanceBaseline {
    fn default() -> Self {
        Self {
            max_latency_ms: default_baseline_max_latency_ms(),
            min_throughput: default_baseline_min_throughput(),
            max_error_rate: default_baseline_max_error_rate(),
        }
    }
}

/// Weights of the four performance-score components. Normalized at use time,
/// so they need not sum to exactly 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_latency_weight")]
    pub latency: f64,

    #[serde(default = "default_throughput_weight")]
    pub throughput: f64,

    #[serde(default = "default_success_weight")]
    pub success_rate: f64,

    #[serde(default = "default_stability_weight")]
    pub stability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: default_latency_weight(),
            throughput: default_throughput_weight(),
            success_rate: default_success_weight(),
            stability: default_stability_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_cache_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            sweep_interval_ms: default_cache_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Topic names are `{prefix}-{family}-{exchange}`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the collector.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols the collector subscribes to upstream.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub alert_thresholds: AlertThresholds,

    #[serde(default)]
    pub performance_baseline: PerformanceBaseline,

    #[serde(default)]
    pub score_weights: ScoreWeights,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub publish: PublishConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            batching: BatchingConfig::default(),
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig::default(),
            pool: PoolConfig::default(),
            alert_thresholds: AlertThresholds::default(),
            performance_baseline: PerformanceBaseline::default(),
            score_weights: ScoreWeights::default(),
            cache: CacheConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            batching = config.batching.enabled,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
