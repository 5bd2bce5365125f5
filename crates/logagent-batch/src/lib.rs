//! Per-sink adaptive batcher: one assembly task turns a bounded stream of
//! records into `BatchEnvelope`s, N worker tasks drain those envelopes and
//! drive them through the sink with retry/backoff and circuit breaking.

mod adaptation;
mod assembly;
mod config;
mod stats;
mod worker;

pub use config::BatcherConfig;
pub use stats::BatcherStats;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use logagent_circuit::CircuitBreaker;
use logagent_core::Record;
use logagent_dlq::DeadLetterQueue;
use logagent_sinks::Sink;
use stats::BatcherStatsInner;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("batcher queue is full")]
    QueueFull,
    #[error("batcher has shut down")]
    Closed,
}

/// Invoked after a batch's records are acknowledged by the sink, once per
/// successful send. The dispatcher wires this to `PositionStore::commit`.
pub type OnSuccess = Arc<dyn Fn(&[Record]) + Send + Sync>;

pub struct AdaptiveBatcher {
    sink_name: String,
    pub(crate) config: BatcherConfig,
    ingress_tx: mpsc::Sender<Record>,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) dlq: Arc<DeadLetterQueue>,
    pub(crate) on_success: OnSuccess,
    pub(crate) stats: BatcherStatsInner,
    pub(crate) latency_samples: parking_lot::Mutex<Vec<Duration>>,
}

pub struct BatcherHandles {
    pub assembly: JoinHandle<()>,
    pub workers: Vec<JoinHandle<()>>,
}

impl AdaptiveBatcher {
    /// Builds the batcher and spawns its assembly + worker tasks. The
    /// assembly task owns the only `Sender` half of the envelope channel,
    /// so cancelling `cancel` and letting assembly return is what lets the
    /// envelope channel close and workers drain to completion.
    pub fn spawn(
        sink_name: impl Into<String>,
        config: BatcherConfig,
        sink: Arc<dyn Sink>,
        breaker: Arc<CircuitBreaker>,
        dlq: Arc<DeadLetterQueue>,
        on_success: OnSuccess,
        cancel: CancellationToken,
    ) -> (Arc<AdaptiveBatcher>, BatcherHandles) {
        let sink_name = sink_name.into();
        let (ingress_tx, ingress_rx) = mpsc::channel(config.channel_capacity);
        let (envelope_tx, envelope_rx) = mpsc::channel(config.worker_count.max(1) * 2);
        let envelope_rx = Arc::new(AsyncMutex::new(envelope_rx));

        let stats = BatcherStatsInner::default();
        stats.current_batch_size.store(config.initial_batch_size, Ordering::Relaxed);
        stats
            .current_flush_delay_ms
            .store(config.initial_flush_delay.as_millis() as u64, Ordering::Relaxed);

        let batcher = Arc::new(AdaptiveBatcher {
            sink_name,
            config: config.clone(),
            ingress_tx,
            sink,
            breaker,
            dlq,
            on_success,
            stats,
            latency_samples: parking_lot::Mutex::new(Vec::new()),
        });

        let assembly_handle = tokio::spawn(assembly::run(batcher.clone(), ingress_rx, envelope_tx, cancel.clone()));

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count.max(1) {
            workers.push(tokio::spawn(worker::run(batcher.clone(), id, envelope_rx.clone(), cancel.clone())));
        }

        if config.adaptation_enabled {
            workers.push(tokio::spawn(adaptation::run(batcher.clone(), cancel.clone())));
        }

        (batcher, BatcherHandles { assembly: assembly_handle, workers })
    }

    pub fn name(&self) -> &str {
        &self.sink_name
    }

    /// Fraction of the ingress channel's capacity currently occupied.
    pub fn utilization(&self) -> f64 {
        let remaining = self.ingress_tx.capacity();
        1.0 - (remaining as f64 / self.config.channel_capacity.max(1) as f64)
    }

    /// Enqueues `record` for this sink, waiting up to `max_wait` when the
    /// channel is at or above the critical threshold, and refusing
    /// immediately at the emergency threshold.
    pub async fn enqueue(&self, record: Record, max_wait: Duration) -> Result<(), EnqueueError> {
        let utilization = self.utilization();

        if utilization >= self.config.emergency_threshold {
            self.stats.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::QueueFull);
        }

        let wait = if utilization >= self.config.critical_threshold {
            max_wait.min(Duration::from_millis(50))
        } else {
            max_wait
        };

        match tokio::time::timeout(wait, self.ingress_tx.send(record)).await {
            Ok(Ok(())) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(EnqueueError::Closed),
            Err(_elapsed) => {
                self.stats.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::QueueFull)
            }
        }
    }

    pub fn stats(&self) -> BatcherStats {
        let queue_depth = self.config.channel_capacity - self.ingress_tx.capacity();
        self.stats.snapshot(queue_depth, self.config.channel_capacity)
    }

    pub fn is_healthy(&self) -> bool {
        self.sink.is_healthy() && self.utilization() < self.config.critical_threshold
    }

    /// Current circuit breaker state, for the admin `/stats` surface.
    pub fn circuit_snapshot(&self) -> logagent_core::CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub(crate) fn current_batch_size(&self) -> usize {
        self.stats.current_batch_size.load(Ordering::Relaxed)
    }

    pub(crate) fn current_flush_delay(&self) -> Duration {
        Duration::from_millis(self.stats.current_flush_delay_ms.load(Ordering::Relaxed))
    }
}

fn clamp_step(current: usize, target: usize, max_step_fraction: f64) -> usize {
    if current == target {
        return current;
    }
    let max_step = ((current as f64) * max_step_fraction).max(1.0) as usize;
    if target > current {
        current + (target - current).min(max_step)
    } else {
        current - (current - target).min(max_step)
    }
}

fn clamp_step_duration(current: Duration, target: Duration, max_step_fraction: f64) -> Duration {
    let current_ms = current.as_millis() as i64;
    let target_ms = target.as_millis() as i64;
    let step = clamp_step(current_ms.max(0) as usize, target_ms.max(0) as usize, max_step_fraction);
    Duration::from_millis(step as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_step_never_exceeds_twenty_percent() {
        assert_eq!(clamp_step(100, 1000, 0.2), 120);
        assert_eq!(clamp_step(1000, 100, 0.2), 800);
        assert_eq!(clamp_step(100, 105, 0.2), 105, "small target reached directly");
    }
}
