//! Wires a `RuntimeConfig` into a running agent: builds every sink, its
//! batcher, circuit breaker, and dead-letter queue, registers them with the
//! dispatcher, and owns the background tasks (position flush/sweep, DLQ
//! reprocessing) and the shutdown sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use logagent_batch::{AdaptiveBatcher, BatcherConfig};
use logagent_circuit::{CircuitBreaker, CircuitBreakerConfig};
use logagent_config::{self as cfgcrate, RuntimeConfig, SinkConfig};
use logagent_core::{Record, RecordSnapshot};
use logagent_dispatcher::{
    Dispatcher, DispatcherConfig, FeedbackAction, FeedbackGuard, FeedbackGuardConfig,
    TokenBucket, TokenBucketConfig, TransformFailurePolicy,
};
use logagent_dlq::{DeadLetterQueue, DlqConfig};
use logagent_position::PositionStore;
use logagent_sinks::http::{AuthMode, BodyCompression, HttpSink, HttpSinkConfig};
use logagent_sinks::local_file::{FileFormat, LocalFileSink, LocalFileSinkConfig};
use logagent_sinks::Sink;
use logagent_timestamp::{TimestampGuard, TimestampGuardConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Agent {
    config: RuntimeConfig,
    dispatcher: Arc<Dispatcher>,
    position_store: Arc<PositionStore>,
    batchers: HashMap<String, Arc<AdaptiveBatcher>>,
    dlqs: HashMap<String, Arc<DeadLetterQueue>>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Agent {
    pub async fn build(config: RuntimeConfig) -> Result<Self> {
        let cancel = CancellationToken::new();

        let position_store = Arc::new(
            PositionStore::new(&config.position_store.directory)
                .context("failed to initialize position store")?,
        );

        let feedback_guard = FeedbackGuard::new(convert_feedback_config(&config.feedback_guard))
            .context("invalid feedback guard configuration (bad self_path_pattern regex)")?;
        let rate_limiter = TokenBucket::new(TokenBucketConfig {
            rate_per_sec: config.dispatcher.rate_limit_per_sec as f64,
            burst: config.dispatcher.rate_limit_burst as f64,
        });
        let dispatcher_config = DispatcherConfig {
            enqueue_wait: Duration::from_millis(config.dispatcher.enqueue_wait_ms),
            dedup_ttl: Duration::from_secs(config.dedup.ttl_secs),
            dedup_capacity: config.dedup.capacity,
            dedup_timestamp_bucket_secs: config.dedup.timestamp_bucket_secs,
            transform_failure_policy: TransformFailurePolicy::default(),
        };
        let dispatcher = Arc::new(Dispatcher::new(dispatcher_config, feedback_guard, rate_limiter, None));
        dispatcher.start();

        let mut batchers = HashMap::new();
        let mut dlqs = HashMap::new();

        for sink_config in &config.sinks {
            let name = sink_config.name().to_string();

            let dlq_dir = config.dlq.directory.join(&name);
            let dlq = Arc::new(
                DeadLetterQueue::start(DlqConfig {
                    directory: dlq_dir,
                    max_file_size_bytes: config.dlq.max_file_size_mb * 1024 * 1024,
                    retention: Duration::from_secs(config.dlq.retention_days * 86_400),
                    min_entry_age: Duration::from_secs(config.dlq.min_entry_age_secs),
                    max_retries: config.dlq.max_retries,
                })
                .with_context(|| format!("failed to start DLQ for sink '{name}'"))?,
            );

            let sink: Arc<dyn Sink> = build_sink(sink_config, &config, dlq.clone())?;
            sink.start().await.with_context(|| format!("failed to start sink '{name}'"))?;

            let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker.failure_threshold,
                open_timeout: Duration::from_secs(config.circuit_breaker.open_timeout_secs),
                max_open_timeout: Duration::from_secs(config.circuit_breaker.max_open_timeout_secs),
                max_probe_requests: config.circuit_breaker.max_probe_requests,
            }));

            let batcher_config = convert_batcher_config(&config.batch);
            let position_store_for_hook = position_store.clone();
            let on_success = Arc::new(move |records: &[Record]| {
                for record in records {
                    if let Some(cursor) = &record.cursor {
                        position_store_for_hook.commit(&record.source_id, cursor.clone());
                    }
                }
            });

            let (batcher, _handles) = AdaptiveBatcher::spawn(
                name.clone(),
                batcher_config,
                sink,
                breaker,
                dlq.clone(),
                on_success,
                cancel.clone(),
            );

            dispatcher.add_sink(batcher.clone(), dlq.clone());
            batchers.insert(name.clone(), batcher);
            dlqs.insert(name, dlq);
        }

        let mut agent = Self {
            config,
            dispatcher,
            position_store,
            batchers,
            dlqs,
            cancel,
            background: Vec::new(),
        };
        agent.spawn_background_tasks();
        Ok(agent)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn position_store(&self) -> Arc<PositionStore> {
        self.position_store.clone()
    }

    pub fn batchers(&self) -> &HashMap<String, Arc<AdaptiveBatcher>> {
        &self.batchers
    }

    pub fn dlqs(&self) -> &HashMap<String, Arc<DeadLetterQueue>> {
        &self.dlqs
    }

    fn spawn_background_tasks(&mut self) {
        let flush_interval = Duration::from_secs(self.config.position_store.flush_interval_secs);
        let position_max_age = Duration::from_secs(self.config.position_store.max_age_secs);
        let position_store = self.position_store.clone();
        let cancel = self.cancel.clone();
        self.background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = position_store.flush() {
                            error!(error = %err, "failed to flush position store");
                        }
                        position_store.sweep(position_max_age);
                    }
                    _ = cancel.cancelled() => {
                        if let Err(err) = position_store.flush() {
                            error!(error = %err, "failed to flush position store during shutdown");
                        }
                        break;
                    }
                }
            }
        }));

        let reprocess_interval = Duration::from_secs(self.config.dlq.reprocess_interval_secs);
        let enqueue_wait = Duration::from_millis(self.config.dispatcher.enqueue_wait_ms);
        for (name, dlq) in &self.dlqs {
            let name = name.clone();
            let dlq = dlq.clone();
            let batcher = self.batchers.get(&name).expect("dlq and batcher registered together").clone();
            let cancel = self.cancel.clone();
            self.background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reprocess_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let now = chrono::Utc::now();
                            if let Err(err) = dlq.cleanup(now) {
                                warn!(sink = name, error = %err, "DLQ cleanup failed");
                            }
                            let dlq = dlq.clone();
                            let batcher = batcher.clone();
                            let reprocessed = tokio::task::spawn_blocking(move || {
                                reprocess_due_blocking(&dlq, &batcher, now, enqueue_wait)
                            }).await;
                            match reprocessed {
                                Ok(Ok((reprocessed, retried))) if reprocessed > 0 || retried > 0 => {
                                    info!(sink = name, reprocessed, retried, "DLQ reprocessing pass");
                                }
                                Ok(Err(err)) => warn!(sink = name, error = %err, "DLQ reprocessing failed"),
                                Ok(Ok(_)) => {}
                                Err(err) => warn!(sink = name, error = %err, "DLQ reprocessing task panicked"),
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }
    }

    /// Idempotent, bounded graceful shutdown: stop accepting new records,
    /// cancel background tasks and batcher workers, then persist whatever
    /// state is left in memory.
    pub async fn stop(&mut self, drain_deadline: Duration) {
        self.dispatcher.stop();
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + drain_deadline;
        for (name, batcher) in &self.batchers {
            while batcher.stats().queue_depth > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if batcher.stats().queue_depth > 0 {
                warn!(sink = name, "shutdown deadline reached with records still queued");
            }
        }

        for handle in self.background.drain(..) {
            let _ = handle.await;
        }

        if let Err(err) = self.position_store.flush() {
            error!(error = %err, "failed to flush position store during shutdown");
        }

        info!("agent stopped");
    }
}

/// Runs on the blocking pool: `DeadLetterQueue::reprocess_due` is
/// synchronous file I/O, but re-driving an entry means pushing it back
/// through the batcher's async channel. `Handle::block_on` from a blocking
/// thread is the standard tokio bridge for that — it never parks an async
/// worker, only the dedicated blocking thread this closure already owns.
fn reprocess_due_blocking(
    dlq: &DeadLetterQueue,
    batcher: &Arc<AdaptiveBatcher>,
    now: chrono::DateTime<chrono::Utc>,
    enqueue_wait: Duration,
) -> Result<(usize, usize)> {
    let handle = tokio::runtime::Handle::current();
    dlq.reprocess_due(now, |entry| {
        entry.records.iter().all(|snapshot| {
            let record = record_from_snapshot(snapshot);
            handle.block_on(batcher.enqueue(record, enqueue_wait)).is_ok()
        })
    })
}

fn record_from_snapshot(snapshot: &RecordSnapshot) -> Record {
    let mut record = Record::new(
        snapshot.source_type,
        snapshot.source_id.clone(),
        snapshot.message.clone(),
        snapshot.timestamp,
        snapshot.processed_at,
        snapshot.labels.clone(),
    )
    .with_level(snapshot.level);
    if let Some(cursor) = &snapshot.cursor {
        record = record.with_cursor(cursor.clone());
    }
    for (key, value) in &snapshot.fields {
        record.set_field(key.clone(), value.clone());
    }
    for step in &snapshot.processing_steps {
        record.push_step(step.clone());
    }
    record
}

fn build_sink(sink_config: &SinkConfig, config: &RuntimeConfig, dlq: Arc<DeadLetterQueue>) -> Result<Arc<dyn Sink>> {
    match sink_config {
        SinkConfig::LocalFile {
            name,
            directory,
            max_size_mb,
            max_files,
            retention_days,
            format,
            text_template,
            disk_warning_pct,
            disk_critical_pct,
        } => {
            let sink = LocalFileSink::new(LocalFileSinkConfig {
                name: name.clone(),
                directory: directory.clone(),
                max_size_bytes: max_size_mb * 1024 * 1024,
                max_files: *max_files,
                retention: Duration::from_secs(retention_days * 86_400),
                format: match format {
                    cfgcrate::FileFormat::Json => FileFormat::Json,
                    cfgcrate::FileFormat::Text => FileFormat::Text,
                },
                text_template: text_template.clone(),
                disk_warning_pct: *disk_warning_pct,
                disk_critical_pct: *disk_critical_pct,
            })
            .with_context(|| format!("failed to initialize local-file sink '{name}'"))?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Http {
            name,
            url,
            method,
            headers,
            auth,
            username,
            password,
            bearer_token,
            tenant_header,
            tenant_id,
            compression,
            request_timeout_secs,
        } => {
            let guard = TimestampGuard::new(convert_timestamp_guard_config(&config.timestamp_guard));
            let sink = HttpSink::new(
                HttpSinkConfig {
                    name: name.clone(),
                    url: url.clone(),
                    method: method.clone(),
                    headers: headers.clone(),
                    auth: match auth {
                        cfgcrate::AuthConfig::None => AuthMode::None,
                        cfgcrate::AuthConfig::Basic => AuthMode::Basic,
                        cfgcrate::AuthConfig::Bearer => AuthMode::Bearer,
                    },
                    username: username.clone(),
                    password: password.clone(),
                    bearer_token: bearer_token.clone(),
                    tenant_header: tenant_header.clone(),
                    tenant_id: tenant_id.clone(),
                    compression: match compression {
                        cfgcrate::CompressionConfig::None => BodyCompression::None,
                        cfgcrate::CompressionConfig::Gzip => BodyCompression::Gzip,
                        cfgcrate::CompressionConfig::Snappy => BodyCompression::Snappy,
                    },
                    request_timeout: Duration::from_secs(*request_timeout_secs),
                },
                guard,
                dlq,
            )
            .with_context(|| format!("failed to initialize http sink '{name}'"))?;
            Ok(Arc::new(sink))
        }
    }
}

fn convert_feedback_config(config: &cfgcrate::FeedbackGuardConfig) -> FeedbackGuardConfig {
    FeedbackGuardConfig {
        action: match config.action {
            cfgcrate::FeedbackAction::Drop => FeedbackAction::Drop,
            cfgcrate::FeedbackAction::Tag => FeedbackAction::Tag,
            cfgcrate::FeedbackAction::Warn => FeedbackAction::Warn,
        },
        self_identifiers: config.self_identifiers.clone(),
        self_container_name: config.self_container_name.clone(),
        self_log_prefix: config.self_log_prefix.clone(),
        self_path_pattern: config.self_path_pattern.clone(),
    }
}

fn convert_timestamp_guard_config(config: &cfgcrate::TimestampGuardConfig) -> TimestampGuardConfig {
    TimestampGuardConfig {
        initial_max_acceptable_age: Duration::from_secs(config.max_acceptable_age_secs),
        max_future_skew: Duration::from_secs(config.max_future_skew_secs),
        min_learning_window: Duration::from_secs(config.min_learning_window_secs),
        shrink_buffer: Duration::from_secs(config.learning_shrink_buffer_secs),
        clamp_enabled: config.clamp_enabled,
    }
}

fn convert_batcher_config(config: &cfgcrate::BatchDefaults) -> BatcherConfig {
    BatcherConfig {
        min_batch_size: config.min_batch_size,
        initial_batch_size: config.initial_batch_size,
        max_batch_size: config.max_batch_size,
        min_flush_delay: Duration::from_millis(config.min_flush_delay_ms),
        initial_flush_delay: Duration::from_millis(config.initial_flush_delay_ms),
        max_flush_delay: Duration::from_millis(config.max_flush_delay_ms),
        adaptation_enabled: config.adaptation_enabled,
        adaptation_interval: Duration::from_secs(config.adaptation_interval_secs),
        latency_threshold: Duration::from_millis(config.latency_threshold_ms),
        throughput_target_per_sec: config.throughput_target_per_sec,
        channel_capacity: config.channel_capacity,
        worker_count: config.worker_count,
        max_retries: config.max_retries,
        base_backoff: Duration::from_millis(config.base_backoff_ms),
        max_backoff: Duration::from_millis(config.max_backoff_ms),
        send_timeout: Duration::from_secs(config.send_timeout_secs),
        warning_threshold: config.warning_threshold,
        critical_threshold: config.critical_threshold,
        emergency_threshold: config.emergency_threshold,
    }
}
