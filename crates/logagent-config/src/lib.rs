//! Layered runtime configuration.
//!
//! Priority, highest to lowest: environment variables, explicit `--config`
//! file, default file locations (`./config.toml`, `./.logagent.toml`),
//! built-in defaults.

mod sources;
mod validation;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use sources::{load_from_path, load_or_default};
pub use validation::validate_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub timestamp_guard: TimestampGuardConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub batch: BatchDefaults,
    #[serde(default)]
    pub position_store: PositionStoreConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub feedback_guard: FeedbackGuardConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            dedup: DedupConfig::default(),
            timestamp_guard: TimestampGuardConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            batch: BatchDefaults::default(),
            position_store: PositionStoreConfig::default(),
            dlq: DlqConfig::default(),
            feedback_guard: FeedbackGuardConfig::default(),
            admin: AdminConfig::default(),
            sinks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}
fn default_rate_limit_burst() -> u32 {
    20_000
}
fn default_enqueue_wait_ms() -> u64 {
    50
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    /// `0` disables timestamp bucketing.
    #[serde(default)]
    pub timestamp_bucket_secs: i64,
}

fn default_dedup_ttl_secs() -> u64 {
    300
}
fn default_dedup_capacity() -> usize {
    1_000_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            capacity: default_dedup_capacity(),
            timestamp_bucket_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampGuardConfig {
    #[serde(default = "default_max_acceptable_age_secs")]
    pub max_acceptable_age_secs: u64,
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u64,
    #[serde(default = "default_min_learning_window_secs")]
    pub min_learning_window_secs: u64,
    #[serde(default = "default_learning_shrink_buffer_secs")]
    pub learning_shrink_buffer_secs: u64,
    #[serde(default)]
    pub clamp_enabled: bool,
}

fn default_max_acceptable_age_secs() -> u64 {
    24 * 3600
}
fn default_max_future_skew_secs() -> u64 {
    60
}
fn default_min_learning_window_secs() -> u64 {
    300
}
fn default_learning_shrink_buffer_secs() -> u64 {
    3600
}

impl Default for TimestampGuardConfig {
    fn default() -> Self {
        Self {
            max_acceptable_age_secs: default_max_acceptable_age_secs(),
            max_future_skew_secs: default_max_future_skew_secs(),
            min_learning_window_secs: default_min_learning_window_secs(),
            learning_shrink_buffer_secs: default_learning_shrink_buffer_secs(),
            clamp_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_max_open_timeout_secs")]
    pub max_open_timeout_secs: u64,
    #[serde(default = "default_max_probe_requests")]
    pub max_probe_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout_secs() -> u64 {
    30
}
fn default_max_open_timeout_secs() -> u64 {
    300
}
fn default_max_probe_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            max_open_timeout_secs: default_max_open_timeout_secs(),
            max_probe_requests: default_max_probe_requests(),
        }
    }
}

/// Default batch/worker/backpressure tuning, applied to every sink. Not
/// currently exposed per-sink: one `AdaptiveBatcher` parameter set shared
/// across the whole agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDefaults {
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_min_flush_delay_ms")]
    pub min_flush_delay_ms: u64,
    #[serde(default = "default_initial_flush_delay_ms")]
    pub initial_flush_delay_ms: u64,
    #[serde(default = "default_max_flush_delay_ms")]
    pub max_flush_delay_ms: u64,
    #[serde(default)]
    pub adaptation_enabled: bool,
    #[serde(default = "default_adaptation_interval_secs")]
    pub adaptation_interval_secs: u64,
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default = "default_throughput_target_per_sec")]
    pub throughput_target_per_sec: f64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,
}

fn default_min_batch_size() -> usize {
    50
}
fn default_initial_batch_size() -> usize {
    200
}
fn default_max_batch_size() -> usize {
    2_000
}
fn default_min_flush_delay_ms() -> u64 {
    200
}
fn default_initial_flush_delay_ms() -> u64 {
    1_000
}
fn default_max_flush_delay_ms() -> u64 {
    10_000
}
fn default_adaptation_interval_secs() -> u64 {
    30
}
fn default_latency_threshold_ms() -> u64 {
    2_000
}
fn default_throughput_target_per_sec() -> f64 {
    500.0
}
fn default_channel_capacity() -> usize {
    10_000
}
fn default_worker_count() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_warning_threshold() -> f64 {
    0.75
}
fn default_critical_threshold() -> f64 {
    0.90
}
fn default_emergency_threshold() -> f64 {
    0.95
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            initial_batch_size: default_initial_batch_size(),
            max_batch_size: default_max_batch_size(),
            min_flush_delay_ms: default_min_flush_delay_ms(),
            initial_flush_delay_ms: default_initial_flush_delay_ms(),
            max_flush_delay_ms: default_max_flush_delay_ms(),
            adaptation_enabled: false,
            adaptation_interval_secs: default_adaptation_interval_secs(),
            latency_threshold_ms: default_latency_threshold_ms(),
            throughput_target_per_sec: default_throughput_target_per_sec(),
            channel_capacity: default_channel_capacity(),
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            send_timeout_secs: default_send_timeout_secs(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            emergency_threshold: default_emergency_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStoreConfig {
    #[serde(default = "default_position_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_position_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_position_dir() -> PathBuf {
    PathBuf::from("/var/lib/logagent/positions")
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_position_max_age_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        Self {
            directory: default_position_dir(),
            flush_interval_secs: default_flush_interval_secs(),
            max_age_secs: default_position_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_dlq_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_dlq_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_dlq_min_entry_age_secs")]
    pub min_entry_age_secs: u64,
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dlq_reprocess_interval_secs")]
    pub reprocess_interval_secs: u64,
}

fn default_dlq_dir() -> PathBuf {
    PathBuf::from("/var/lib/logagent/dlq")
}
fn default_dlq_max_file_size_mb() -> u64 {
    64
}
fn default_dlq_retention_days() -> u64 {
    7
}
fn default_dlq_min_entry_age_secs() -> u64 {
    60
}
fn default_dlq_max_retries() -> u32 {
    5
}
fn default_dlq_reprocess_interval_secs() -> u64 {
    60
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            directory: default_dlq_dir(),
            max_file_size_mb: default_dlq_max_file_size_mb(),
            retention_days: default_dlq_retention_days(),
            min_entry_age_secs: default_dlq_min_entry_age_secs(),
            max_retries: default_dlq_max_retries(),
            reprocess_interval_secs: default_dlq_reprocess_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackAction {
    Drop,
    Tag,
    Warn,
}

impl Default for FeedbackAction {
    fn default() -> Self {
        FeedbackAction::Drop
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackGuardConfig {
    #[serde(default)]
    pub action: FeedbackAction,
    #[serde(default)]
    pub self_identifiers: Vec<String>,
    #[serde(default)]
    pub self_container_name: Option<String>,
    #[serde(default)]
    pub self_log_prefix: Option<String>,
    #[serde(default)]
    pub self_path_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_admin_listen_addr() -> String {
    "127.0.0.1:9331".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_admin_listen_addr(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Json,
    Text,
}

impl Default for FileFormat {
    fn default() -> Self {
        FileFormat::Json
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthConfig {
    None,
    Basic,
    Bearer,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionConfig {
    None,
    Gzip,
    Snappy,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig::None
    }
}

/// One configured downstream sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    LocalFile {
        name: String,
        directory: PathBuf,
        #[serde(default = "default_local_file_max_size_mb")]
        max_size_mb: u64,
        #[serde(default = "default_local_file_max_files")]
        max_files: u32,
        #[serde(default = "default_local_file_retention_days")]
        retention_days: u64,
        #[serde(default)]
        format: FileFormat,
        #[serde(default)]
        text_template: Option<String>,
        #[serde(default = "default_disk_warning_pct")]
        disk_warning_pct: f64,
        #[serde(default = "default_disk_critical_pct")]
        disk_critical_pct: f64,
    },
    Http {
        name: String,
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        auth: AuthConfig,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        tenant_header: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
        #[serde(default)]
        compression: CompressionConfig,
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::LocalFile { name, .. } => name,
            SinkConfig::Http { name, .. } => name,
        }
    }
}

fn default_local_file_max_size_mb() -> u64 {
    100
}
fn default_local_file_max_files() -> u32 {
    10
}
fn default_local_file_retention_days() -> u64 {
    7
}
fn default_disk_warning_pct() -> f64 {
    0.15
}
fn default_disk_critical_pct() -> f64 {
    0.05
}
fn default_http_method() -> String {
    "POST".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl fmt::Display for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkConfig::LocalFile { name, .. } => write!(f, "local_file({name})"),
            SinkConfig::Http { name, .. } => write!(f, "http({name})"),
        }
    }
}
