//! Per-source resume cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The stream a container cursor is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStream {
    Stdout,
    Stderr,
}

/// Resume cursor for a local file source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCursor {
    pub path: String,
    pub inode: u64,
    pub size: u64,
    pub offset: u64,
    /// Hash of the first N bytes, used to tell rotation (same path, new
    /// inode) apart from a bind-mount inode reuse.
    pub checksum_of_first_n_bytes: String,
    pub last_modified: DateTime<Utc>,
}

impl FileCursor {
    /// `true` if `size < offset`: the file shrank under us (truncation).
    pub fn is_truncated(&self) -> bool {
        self.size < self.offset
    }

    /// Reset to the start of a freshly rotated (or truncated) file.
    pub fn reset_to_zero(&mut self, new_inode: u64, new_size: u64, checksum: String) {
        self.inode = new_inode;
        self.size = new_size;
        self.offset = 0;
        self.checksum_of_first_n_bytes = checksum;
        self.last_modified = Utc::now();
    }
}

/// Resume cursor for a container runtime stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCursor {
    pub container_id: String,
    pub container_name: String,
    pub stream: ContainerStream,
    pub last_timestamp: DateTime<Utc>,
}

/// Per-source resume information, persisted by `PositionStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceCursor {
    File(FileCursor),
    Container(ContainerCursor),
}

impl SourceCursor {
    /// Cursor ordering used by the monotonicity invariant: byte offset for
    /// files, timestamp for containers. Returns `None` when comparing
    /// cursors of different source types (comparison is not meaningful).
    pub fn advances_past(&self, previous: &SourceCursor) -> Option<bool> {
        match (self, previous) {
            (SourceCursor::File(new), SourceCursor::File(old)) => {
                if new.inode != old.inode {
                    // Rotation: any new cursor on the new inode is an advance.
                    Some(true)
                } else {
                    Some(new.offset >= old.offset)
                }
            }
            (SourceCursor::Container(new), SourceCursor::Container(old)) => {
                Some(new.last_timestamp >= old.last_timestamp)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_cursor(offset: u64, inode: u64) -> SourceCursor {
        SourceCursor::File(FileCursor {
            path: "/var/log/x".into(),
            inode,
            size: offset.max(1000),
            offset,
            checksum_of_first_n_bytes: "abc".into(),
            last_modified: Utc::now(),
        })
    }

    #[test]
    fn rejects_backwards_offset_same_inode() {
        let old = file_cursor(800, 123);
        let new = file_cursor(400, 123);
        assert_eq!(new.advances_past(&old), Some(false));
    }

    #[test]
    fn rotation_always_advances() {
        let old = file_cursor(1000, 123);
        let new = file_cursor(0, 456);
        assert_eq!(new.advances_past(&old), Some(true));
    }

    #[test]
    fn truncation_detected_by_size_lt_offset() {
        let mut cursor = FileCursor {
            path: "/var/log/x".into(),
            inode: 123,
            size: 500,
            offset: 800,
            checksum_of_first_n_bytes: "abc".into(),
            last_modified: Utc::now(),
        };
        assert!(cursor.is_truncated());
        cursor.reset_to_zero(123, 500, "def".into());
        assert_eq!(cursor.offset, 0);
    }
}
