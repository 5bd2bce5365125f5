use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use logagent_core::{BatchEnvelope, DlqEntry, SinkErrorKind};
use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::AdaptiveBatcher;

/// Drains `BatchEnvelope`s from the shared receiver and drives each one
/// through the circuit breaker, the sink, and retry/backoff, to completion
/// or to the dead-letter queue. Multiple workers share one receiver behind
/// an async mutex: a worker only holds the lock while polling for the next
/// envelope, never while sending.
pub(crate) async fn run(
    batcher: Arc<AdaptiveBatcher>,
    worker_id: usize,
    envelope_rx: Arc<AsyncMutex<mpsc::Receiver<BatchEnvelope>>>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = {
            let mut rx = envelope_rx.lock().await;
            rx.recv().await
        };
        let Some(envelope) = envelope else {
            break;
        };
        handle_envelope(&batcher, envelope, &cancel).await;
    }
    warn!(sink = batcher.name(), worker_id, "worker exiting, envelope channel closed");
}

async fn handle_envelope(batcher: &AdaptiveBatcher, mut envelope: BatchEnvelope, cancel: &CancellationToken) {
    loop {
        let now = Utc::now();
        if !batcher.breaker.allow(now) {
            batcher.stats.circuit_blocked.fetch_add(1, Ordering::Relaxed);
            counter!("logagent.batcher.circuit_blocked", 1, "sink" => batcher.name().to_string());
            route_to_dlq(batcher, &envelope, "circuit_open", "circuit breaker is open");
            return;
        }

        envelope.record_attempt();
        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            result = tokio::time::timeout(batcher.config.send_timeout, batcher.sink.send(&envelope.records)) => result,
            _ = cancel.cancelled() => {
                warn!(sink = batcher.name(), "send aborted by shutdown");
                route_to_dlq(batcher, &envelope, "shutdown_aborted", "send aborted during shutdown");
                return;
            }
        };

        let send_result = match outcome {
            Ok(inner) => inner,
            Err(_elapsed) => Err(logagent_core::SinkError::new(SinkErrorKind::Temporary, "send timed out")),
        };

        match send_result {
            Ok(()) => {
                batcher.breaker.record_success();
                (batcher.on_success)(&envelope.records);
                batcher.stats.sent_ok.fetch_add(1, Ordering::Relaxed);
                batcher.latency_samples.lock().push(started.elapsed());
                let sink = batcher.name().to_string();
                counter!("logagent.batcher.sent_ok", 1, "sink" => sink.clone());
                histogram!("logagent.batcher.send_latency_ms", started.elapsed().as_millis() as f64, "sink" => sink);
                return;
            }
            Err(err) => {
                if err.kind.counts_against_breaker() {
                    batcher.breaker.record_failure(now);
                }
                batcher.stats.sent_failed.fetch_add(1, Ordering::Relaxed);
                counter!("logagent.batcher.sent_failed", 1, "sink" => batcher.name().to_string(), "kind" => err.kind.to_string());

                let retryable = err.kind.is_retryable() && envelope.retry_count < batcher.config.max_retries;
                if !retryable {
                    route_to_dlq(batcher, &envelope, &err.kind.to_string(), &err.message);
                    return;
                }

                let retry_after = err.retry_after;
                envelope.record_failure(err.kind, err.message.clone());
                batcher.stats.retried.fetch_add(1, Ordering::Relaxed);
                counter!("logagent.batcher.retried", 1, "sink" => batcher.name().to_string());

                let mut backoff = backoff_with_jitter(batcher, envelope.retry_count);
                if let Some(floor) = retry_after {
                    backoff = backoff.max(floor);
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        route_to_dlq(batcher, &envelope, "shutdown_aborted", "retry backoff interrupted by shutdown");
                        return;
                    }
                }
            }
        }
    }
}

fn backoff_with_jitter(batcher: &AdaptiveBatcher, retry_count: u32) -> Duration {
    let exp = 2u32.saturating_pow(retry_count.min(20));
    let base = batcher.config.base_backoff.saturating_mul(exp).min(batcher.config.max_backoff);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * jitter).min(batcher.config.max_backoff)
}

fn route_to_dlq(batcher: &AdaptiveBatcher, envelope: &BatchEnvelope, error_kind: &str, error_message: &str) {
    let entry = DlqEntry::from_batch(envelope, error_kind, error_message, HashMap::new());
    if let Err(err) = batcher.dlq.enqueue(&entry) {
        error!(sink = batcher.name(), error = %err, "failed to write dead-lettered batch");
    }
    batcher.stats.dlq_routed.fetch_add(1, Ordering::Relaxed);
    counter!("logagent.batcher.dlq_routed", 1, "sink" => batcher.name().to_string(), "reason" => error_kind.to_string());
}
