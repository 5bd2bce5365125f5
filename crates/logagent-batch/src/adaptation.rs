use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{clamp_step, clamp_step_duration, AdaptiveBatcher};

/// Periodically nudges batch size and flush delay toward the configured
/// latency/throughput targets. The latency sample window is reallocated
/// fresh every interval rather than trimmed in place, so a batcher that
/// runs for days never accumulates an unbounded backlog of old samples.
pub(crate) async fn run(batcher: Arc<AdaptiveBatcher>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(batcher.config.adaptation_interval) => {}
            _ = cancel.cancelled() => break,
        }

        let samples = std::mem::replace(&mut *batcher.latency_samples.lock(), Vec::new());
        if samples.is_empty() {
            continue;
        }

        let avg_latency = samples.iter().sum::<std::time::Duration>() / samples.len() as u32;
        let throughput = samples.len() as f64 / batcher.config.adaptation_interval.as_secs_f64();

        let current_batch = batcher.current_batch_size();
        let current_delay = batcher.current_flush_delay();

        let (target_batch, target_delay) = if avg_latency > batcher.config.latency_threshold {
            // Sink is slow: smaller batches, shorter delay, to keep tail latency down.
            (current_batch.saturating_sub(current_batch / 5).max(batcher.config.min_batch_size), batcher.config.min_flush_delay)
        } else if throughput < batcher.config.throughput_target_per_sec {
            // Headroom and throughput below target: batch bigger, wait a bit longer.
            ((current_batch + current_batch / 5).min(batcher.config.max_batch_size), batcher.config.max_flush_delay)
        } else {
            (current_batch, current_delay)
        };

        let new_batch = clamp_step(current_batch, target_batch, 0.2).clamp(batcher.config.min_batch_size, batcher.config.max_batch_size);
        let new_delay = clamp_step_duration(current_delay, target_delay, 0.2)
            .clamp(batcher.config.min_flush_delay, batcher.config.max_flush_delay);

        batcher.stats.current_batch_size.store(new_batch, Ordering::Relaxed);
        batcher.stats.current_flush_delay_ms.store(new_delay.as_millis() as u64, Ordering::Relaxed);

        debug!(
            sink = batcher.name(),
            avg_latency_ms = avg_latency.as_millis() as u64,
            throughput,
            new_batch,
            new_delay_ms = new_delay.as_millis() as u64,
            "batcher adapted"
        );
    }
}
