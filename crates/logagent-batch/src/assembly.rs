use std::sync::Arc;
use std::time::{Duration, Instant};

use logagent_core::{BatchEnvelope, Record};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::AdaptiveBatcher;

/// Turns a stream of individual records into size- or delay-bounded
/// `BatchEnvelope`s. Owns the only `Sender` half of the envelope channel, so
/// returning from this loop (on cancellation) is what lets workers drain and
/// exit once the channel empties.
pub(crate) async fn run(
    batcher: Arc<AdaptiveBatcher>,
    mut ingress_rx: mpsc::Receiver<Record>,
    envelope_tx: mpsc::Sender<BatchEnvelope>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<Record> = Vec::new();
    let mut first_buffered_at: Option<Instant> = None;

    loop {
        let sleep_for = match first_buffered_at {
            Some(started) => batcher.current_flush_delay().saturating_sub(started.elapsed()),
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            received = ingress_rx.recv() => {
                match received {
                    Some(record) => {
                        if first_buffered_at.is_none() {
                            first_buffered_at = Some(Instant::now());
                        }
                        buffer.push(record);
                        if buffer.len() >= batcher.current_batch_size() {
                            flush(&batcher, &envelope_tx, &mut buffer).await;
                            first_buffered_at = None;
                        }
                    }
                    None => {
                        flush(&batcher, &envelope_tx, &mut buffer).await;
                        debug!(sink = batcher.name(), "ingress closed, assembly task exiting");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(sleep_for), if first_buffered_at.is_some() => {
                flush(&batcher, &envelope_tx, &mut buffer).await;
                first_buffered_at = None;
            }
            _ = cancel.cancelled() => {
                flush(&batcher, &envelope_tx, &mut buffer).await;
                debug!(sink = batcher.name(), "cancelled, draining final batch");
                break;
            }
        }
    }
}

async fn flush(batcher: &AdaptiveBatcher, envelope_tx: &mpsc::Sender<BatchEnvelope>, buffer: &mut Vec<Record>) {
    if buffer.is_empty() {
        return;
    }
    let records = std::mem::take(buffer);
    let envelope = BatchEnvelope::new(batcher.name().to_string(), records);
    if envelope_tx.send(envelope).await.is_err() {
        debug!(sink = batcher.name(), "envelope channel closed early, dropping batch");
    }
}
