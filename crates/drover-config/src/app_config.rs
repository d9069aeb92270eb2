//! Application configuration structures.

use drover_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Which store backend holds job state.
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue manager lifecycle settings.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Tracing configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Prometheus exporter configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Named queues, created at startup.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSettings>,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "drover".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Redis sorted sets and Lua scripts.
    #[default]
    Redis,
    /// Process-local store; state is lost on restart.
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend used for job state.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Prefix applied to every store key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on time spent retrying a transient store error.
    #[serde(default = "default_transient_retry_ms")]
    pub transient_retry_max_elapsed_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            key_prefix: default_key_prefix(),
            transient_retry_max_elapsed_ms: default_transient_retry_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "drover".to_string()
}

fn default_transient_retry_ms() -> u64 {
    5_000
}

impl StoreConfig {
    /// Returns the transient retry budget as a Duration.
    #[must_use]
    pub const fn transient_retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.transient_retry_max_elapsed_ms)
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Time to wait for a pooled connection, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    5
}

impl RedisConfig {
    /// Returns the connection wait timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Queue manager lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long `stop` waits for running handlers, in seconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// How often the server logs a stats snapshot (0 disables).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

impl ManagerConfig {
    /// Returns the drain timeout as a Duration.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Returns the stats log interval, or `None` when disabled.
    #[must_use]
    pub const fn stats_interval(&self) -> Option<Duration> {
        if self.stats_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stats_interval_secs))
        }
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,
    /// Address the scrape endpoint listens on.
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9464".to_string()
}

/// Per-queue settings as they appear in configuration files.
///
/// Durations are plain milliseconds so they read naturally in TOML and in
/// `DROVER_QUEUES__<NAME>__<FIELD>` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Worker slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Number of distinct priority tiers; 0 is the highest.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u8,
    /// How long a claim is honored before the job may be reclaimed.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Per-job handler deadline.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Total executions allowed before dead-lettering.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Retry delay cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Spread retry delays by ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Shortest idle poll of an empty ready set.
    #[serde(default = "default_poll_min_ms")]
    pub poll_interval_min_ms: u64,
    /// Longest idle poll of an empty ready set.
    #[serde(default = "default_poll_max_ms")]
    pub poll_interval_max_ms: u64,
    /// Ceiling for the promoter's backoff on an idle delayed set.
    #[serde(default = "default_promoter_max_ms")]
    pub promoter_max_interval_ms: u64,
    /// Lock reclaim scan period; derived from `lock_ttl_ms` when absent.
    #[serde(default)]
    pub reclaim_interval_ms: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            priority_levels: default_priority_levels(),
            lock_ttl_ms: default_lock_ttl_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            poll_interval_min_ms: default_poll_min_ms(),
            poll_interval_max_ms: default_poll_max_ms(),
            promoter_max_interval_ms: default_promoter_max_ms(),
            reclaim_interval_ms: None,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_priority_levels() -> u8 {
    3
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_job_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_jitter() -> bool {
    true
}

fn default_poll_min_ms() -> u64 {
    10
}

fn default_poll_max_ms() -> u64 {
    500
}

fn default_promoter_max_ms() -> u64 {
    1_000
}
