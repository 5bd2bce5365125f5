//! The destination interface every sink implements.

use async_trait::async_trait;
use logagent_core::{Record, SinkError};

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    /// Sends `records` as one unit. Callers pass an already-batched slice;
    /// a sink that needs to split it internally (e.g. by stream) does so
    /// and treats the whole call as one outcome.
    async fn send(&self, records: &[Record]) -> Result<(), SinkError>;

    /// Drains in-flight work; no new sends are accepted afterward.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Recent success within the health window and circuit closed.
    fn is_healthy(&self) -> bool;
}
