//! Shared record, cursor, batch, and error types for the log agent.
//!
//! This crate contains no I/O and no async runtime: it is the "essence"
//! layer (data model + pure classification) that every other crate in the
//! workspace builds on.

pub mod batch;
pub mod circuit;
pub mod cursor;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod record;

pub use batch::BatchEnvelope;
pub use circuit::{BreakerState, CircuitSnapshot};
pub use cursor::{ContainerCursor, ContainerStream, FileCursor, SourceCursor};
pub use dedup::DedupKey;
pub use dlq::{DlqEntry, RecordSnapshot};
pub use error::{DropReason, RejectKind, SinkError, SinkErrorKind};
pub use record::{Level, ProcessingStep, Record, SourceType};
