//! Configuration validation: required fields present, values sensible.

use anyhow::{bail, Result};
use tracing::warn;

use crate::{BatchDefaults, RuntimeConfig, SinkConfig};

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    if config.sinks.is_empty() {
        bail!("at least one sink must be configured");
    }

    let mut seen_names = std::collections::HashSet::new();
    for sink in &config.sinks {
        if !seen_names.insert(sink.name().to_string()) {
            bail!("duplicate sink name: {}", sink.name());
        }
        validate_sink(sink)?;
    }

    validate_batch_defaults(&config.batch)?;

    if config.circuit_breaker.failure_threshold == 0 {
        bail!("circuit_breaker.failure_threshold must be greater than 0");
    }
    if config.circuit_breaker.max_probe_requests == 0 {
        bail!("circuit_breaker.max_probe_requests must be greater than 0");
    }
    if config.dedup.capacity == 0 {
        bail!("dedup.capacity must be greater than 0");
    }
    if config.timestamp_guard.max_acceptable_age_secs == 0 {
        bail!("timestamp_guard.max_acceptable_age_secs must be greater than 0");
    }

    Ok(())
}

fn validate_sink(sink: &SinkConfig) -> Result<()> {
    match sink {
        SinkConfig::LocalFile {
            name,
            max_size_mb,
            disk_warning_pct,
            disk_critical_pct,
            ..
        } => {
            if *max_size_mb == 0 {
                bail!("sink '{name}': max_size_mb must be greater than 0");
            }
            if !(*disk_critical_pct < *disk_warning_pct) {
                bail!(
                    "sink '{name}': disk_critical_pct ({disk_critical_pct}) must be less than disk_warning_pct ({disk_warning_pct})"
                );
            }
        }
        SinkConfig::Http {
            name,
            url,
            request_timeout_secs,
            ..
        } => {
            if url.is_empty() {
                bail!("sink '{name}': url must not be empty");
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("sink '{name}': url must start with http:// or https://");
            }
            if *request_timeout_secs == 0 {
                bail!("sink '{name}': request_timeout_secs must be greater than 0");
            }
        }
    }
    Ok(())
}

fn validate_batch_defaults(batch: &BatchDefaults) -> Result<()> {
    if batch.min_batch_size == 0 || batch.min_batch_size > batch.max_batch_size {
        bail!("batch.min_batch_size must be > 0 and <= max_batch_size");
    }
    if batch.initial_batch_size < batch.min_batch_size || batch.initial_batch_size > batch.max_batch_size {
        bail!("batch.initial_batch_size must fall within [min_batch_size, max_batch_size]");
    }
    if batch.min_flush_delay_ms == 0 || batch.min_flush_delay_ms > batch.max_flush_delay_ms {
        bail!("batch.min_flush_delay_ms must be > 0 and <= max_flush_delay_ms");
    }
    if batch.worker_count == 0 {
        bail!("batch.worker_count must be greater than 0");
    }
    if batch.channel_capacity == 0 {
        bail!("batch.channel_capacity must be greater than 0");
    }
    if !(batch.warning_threshold < batch.critical_threshold && batch.critical_threshold < batch.emergency_threshold) {
        bail!("batch thresholds must satisfy warning < critical < emergency");
    }
    if batch.emergency_threshold > 1.0 {
        warn!(
            emergency_threshold = batch.emergency_threshold,
            "batch.emergency_threshold above 1.0 will never trigger"
        );
    }
    Ok(())
}
