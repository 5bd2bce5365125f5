//! The pluggable record-transform step. Concrete parsing pipelines
//! (regex/JSON/timestamp parsers) are out of scope for this crate — a
//! transform is any pure `Fn(&Record) -> Result<(), String>` that mutates
//! the record's fields/labels in place via its accessor methods and
//! reports success or a diagnostic message.

use std::sync::Arc;

use logagent_core::Record;

pub type TransformFn = Arc<dyn Fn(&Record) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformFailurePolicy {
    /// Count the error and forward the untransformed record (default).
    SkipFailed,
    /// Count the error and drop the record entirely.
    Drop,
}

impl Default for TransformFailurePolicy {
    fn default() -> Self {
        TransformFailurePolicy::SkipFailed
    }
}
