//! Content fingerprinting for deduplication.

use chrono::{DateTime, Utc};

/// A content fingerprint: `hash(source_id ∥ message ∥ optional bucket)`.
/// Stored in the dedup cache keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// `timestamp_bucket_secs`, when `Some`, is the width (in seconds) of
    /// the bucket a record's timestamp is rounded into before hashing —
    /// this lets two records with the same content but timestamps a few
    /// milliseconds apart still collide, while records far apart in time
    /// are treated as distinct re-emissions.
    pub fn new(source_id: &str, message: &str, timestamp: Option<(DateTime<Utc>, i64)>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(message.as_bytes());
        if let Some((ts, bucket_secs)) = timestamp {
            if bucket_secs > 0 {
                let bucket = ts.timestamp() / bucket_secs;
                hasher.update(b"\0");
                hasher.update(&bucket.to_le_bytes());
            }
        }
        DedupKey(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}
