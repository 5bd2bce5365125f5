//! Per-source cursor durability. The store itself is a plain, lock-guarded
//! in-memory map with disk read-through/write-behind; the periodic flush
//! loop and graceful-stop sequencing live in the binary that owns a
//! `CancellationToken` for this component, matching how the config crate
//! separates "load this value" from "when does loading happen".

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use logagent_core::SourceCursor;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{info, warn};

struct Tracked {
    cursor: SourceCursor,
    dirty: bool,
    last_touched: SystemTime,
}

pub struct PositionStore {
    directory: PathBuf,
    state: Mutex<HashMap<String, Tracked>>,
}

impl PositionStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create position directory: {}", directory.display()))?;
        Ok(Self {
            directory,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Updates the in-memory position for `source_id` if `cursor` advances
    /// past what's already recorded. Returns `false` (and logs) on a
    /// non-monotonic attempt, which the store rejects defensively rather
    /// than silently applying.
    pub fn commit(&self, source_id: &str, cursor: SourceCursor) -> bool {
        let mut state = self.state.lock();
        match state.get(source_id) {
            Some(existing) => match cursor.advances_past(&existing.cursor) {
                Some(true) => {
                    state.insert(
                        source_id.to_string(),
                        Tracked { cursor, dirty: true, last_touched: SystemTime::now() },
                    );
                    true
                }
                Some(false) => {
                    warn!(source_id, "rejecting non-monotonic position advance");
                    false
                }
                None => {
                    // Cursor kind changed under us (e.g. file -> container);
                    // treat the new kind as authoritative.
                    state.insert(
                        source_id.to_string(),
                        Tracked { cursor, dirty: true, last_touched: SystemTime::now() },
                    );
                    true
                }
            },
            None => {
                state.insert(
                    source_id.to_string(),
                    Tracked { cursor, dirty: true, last_touched: SystemTime::now() },
                );
                true
            }
        }
    }

    /// Read-through load: returns the in-memory cursor if present,
    /// otherwise reads the on-disk file for `source_id` and caches it.
    pub fn load(&self, source_id: &str) -> Option<SourceCursor> {
        {
            let state = self.state.lock();
            if let Some(tracked) = state.get(source_id) {
                return Some(tracked.cursor.clone());
            }
        }

        let path = self.path_for(source_id);
        let content = fs::read_to_string(&path).ok()?;
        let cursor: SourceCursor = serde_json::from_str(&content).ok()?;

        let mut state = self.state.lock();
        state.insert(
            source_id.to_string(),
            Tracked { cursor: cursor.clone(), dirty: false, last_touched: SystemTime::now() },
        );
        Some(cursor)
    }

    /// Writes every dirty cursor to disk via temp-file-then-rename, and
    /// clears the dirty flag on success.
    pub fn flush(&self) -> Result<()> {
        let dirty_entries: Vec<(String, SourceCursor)> = {
            let state = self.state.lock();
            state
                .iter()
                .filter(|(_, t)| t.dirty)
                .map(|(id, t)| (id.clone(), t.cursor.clone()))
                .collect()
        };

        for (source_id, cursor) in &dirty_entries {
            self.write_atomic(source_id, cursor)?;
        }

        if !dirty_entries.is_empty() {
            let mut state = self.state.lock();
            for (source_id, _) in &dirty_entries {
                if let Some(tracked) = state.get_mut(source_id) {
                    tracked.dirty = false;
                }
            }
        }

        counter!("logagent.position.flushes", 1);
        gauge!("logagent.position.tracked_sources", self.state.lock().len() as f64);
        Ok(())
    }

    fn write_atomic(&self, source_id: &str, cursor: &SourceCursor) -> Result<()> {
        let path = self.path_for(source_id);
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(cursor)?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write temp position file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename position file into place: {}", path.display()))?;
        Ok(())
    }

    /// Removes cursors untouched for longer than `max_age`. Does not
    /// delete the on-disk file; a source that reappears later re-learns
    /// its position from disk via `load`.
    pub fn sweep(&self, max_age: Duration) {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        let before = state.len();
        state.retain(|_, tracked| {
            now.duration_since(tracked.last_touched).unwrap_or(Duration::ZERO) <= max_age
        });
        let removed = before - state.len();
        if removed > 0 {
            info!(removed, "swept stale positions from memory");
        }
    }

    pub fn snapshot(&self) -> HashMap<String, SourceCursor> {
        self.state
            .lock()
            .iter()
            .map(|(id, t)| (id.clone(), t.cursor.clone()))
            .collect()
    }

    fn path_for(&self, source_id: &str) -> PathBuf {
        let encoded = encode_source_id(source_id);
        self.directory.join(format!("{encoded}.json"))
    }
}

/// Source ids are file paths or container ids; neither is safe as a bare
/// filename, so filesystem-hostile characters are replaced with `_` for
/// readability and a `blake3` hash of the full, unmodified id is appended
/// as a collision-free suffix — the sanitized stem alone is lossy (two
/// distinct ids can replace to the same characters), so the hash, not the
/// stem, is what actually keeps distinct sources on distinct files.
fn encode_source_id(source_id: &str) -> String {
    let stem: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(80)
        .collect();
    let hash = blake3::hash(source_id.as_bytes());
    format!("{stem}-{}", &hash.to_hex()[..16])
}

/// Needed only so tests can construct a `DateTime<Utc>` baseline without
/// pulling in the `chrono` "now" path inside the crate itself.
#[cfg(test)]
fn utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}
