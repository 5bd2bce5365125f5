use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub min_batch_size: usize,
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    pub min_flush_delay: Duration,
    pub initial_flush_delay: Duration,
    pub max_flush_delay: Duration,
    pub adaptation_enabled: bool,
    pub adaptation_interval: Duration,
    pub latency_threshold: Duration,
    pub throughput_target_per_sec: f64,
    pub channel_capacity: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub emergency_threshold: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 50,
            initial_batch_size: 200,
            max_batch_size: 2000,
            min_flush_delay: Duration::from_millis(200),
            initial_flush_delay: Duration::from_millis(1000),
            max_flush_delay: Duration::from_secs(10),
            adaptation_enabled: false,
            adaptation_interval: Duration::from_secs(30),
            latency_threshold: Duration::from_secs(2),
            throughput_target_per_sec: 500.0,
            channel_capacity: 10_000,
            worker_count: 4,
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            emergency_threshold: 0.95,
        }
    }
}
