//! Append-only, size-rotated dead-letter storage.
//!
//! Entries are newline-delimited JSON, oldest file first. The queue never
//! needs its entries resident in memory: `stats` and `reprocess_due` both
//! stream a file at a time straight from disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use logagent_core::DlqEntry;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub directory: PathBuf,
    pub max_file_size_bytes: u64,
    pub retention: Duration,
    pub min_entry_age: Duration,
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/logagent/dlq"),
            max_file_size_bytes: 64 * 1024 * 1024,
            retention: Duration::from_secs(7 * 86_400),
            min_entry_age: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub entries_total: usize,
    pub entries_by_error_kind: std::collections::HashMap<String, usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter queue is full")]
    Full,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

struct CurrentFile {
    path: PathBuf,
    size: u64,
}

pub struct DeadLetterQueue {
    config: DlqConfig,
    current: Mutex<Option<CurrentFile>>,
}

impl DeadLetterQueue {
    /// Creates the directory if needed. Matches the contract's "`Start()`
    /// scans the directory... but does not need to reload entries into
    /// memory": nothing here reads file contents, only ensures the
    /// directory exists so the first `enqueue` can open a file.
    pub fn start(config: DlqConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)
            .with_context(|| format!("failed to create DLQ directory: {}", config.directory.display()))?;
        Ok(Self { config, current: Mutex::new(None) })
    }

    pub fn enqueue(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let line = serde_json::to_string(entry).map_err(|e| DlqError::Io(e.into()))?;
        let mut current = self.current.lock();

        let needs_new_file = match current.as_ref() {
            Some(f) => f.size + line.len() as u64 + 1 > self.config.max_file_size_bytes,
            None => true,
        };
        if needs_new_file {
            let path = self.new_file_path();
            *current = Some(CurrentFile { path, size: 0 });
        }

        let file = current.as_mut().expect("current file just ensured");
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)
            .map_err(|e| DlqError::Io(e.into()))?;
        writeln!(handle, "{line}").map_err(|e| DlqError::Io(e.into()))?;
        handle.sync_data().ok();
        file.size += line.len() as u64 + 1;

        counter!("logagent.dlq.enqueued", 1, "sink" => entry.original_sink.clone(), "error_kind" => entry.error_kind.clone());
        Ok(())
    }

    fn new_file_path(&self) -> PathBuf {
        let now = Utc::now();
        self.config
            .directory
            .join(format!("dlq_{}.log", now.format("%Y%m%d_%H%M%S")))
    }

    fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.directory)
            .with_context(|| format!("failed to read DLQ directory: {}", self.config.directory.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn stats(&self) -> Result<DlqStats> {
        let mut stats = DlqStats::default();
        for path in self.rotated_files()? {
            let metadata = fs::metadata(&path)?;
            stats.file_count += 1;
            stats.total_bytes += metadata.len();
            for entry in read_entries(&path)? {
                stats.entries_total += 1;
                *stats.entries_by_error_kind.entry(entry.error_kind.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    /// Deletes whole rotated files older than `retention`. An entire file
    /// ages out together; individual entries within a retained file are
    /// not pruned.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for path in self.rotated_files()? {
            let metadata = fs::metadata(&path)?;
            let modified: DateTime<Utc> = metadata.modified()?.into();
            let age = (now - modified).to_std().unwrap_or(Duration::ZERO);
            if age > self.config.retention {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove expired DLQ file: {}", path.display()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "removed expired DLQ files");
            counter!("logagent.dlq.files_expired", removed as u64);
        }
        Ok(removed)
    }

    /// Drains entries eligible for reprocessing (age >= `min_entry_age`,
    /// `attempt_count < max_retries`) through `callback`. A `true` result
    /// drops the entry; `false` increments `attempt_count` and keeps it in
    /// the queue. Entries already at `max_retries` are left untouched
    /// until TTL cleanup removes their file.
    pub fn reprocess_due(
        &self,
        now: DateTime<Utc>,
        mut callback: impl FnMut(&DlqEntry) -> bool,
    ) -> Result<(usize, usize)> {
        let mut reprocessed = 0;
        let mut retried = 0;

        for path in self.rotated_files()? {
            if self.is_current_file(&path) {
                continue;
            }

            let entries = read_entries(&path)?;
            let mut kept = Vec::with_capacity(entries.len());
            let mut changed = false;

            for mut entry in entries {
                let age = (now - entry.enqueued_at).to_std().unwrap_or(Duration::ZERO);
                let eligible = age >= self.config.min_entry_age && entry.attempt_count < self.config.max_retries;

                if !eligible {
                    kept.push(entry);
                    continue;
                }

                if callback(&entry) {
                    reprocessed += 1;
                    changed = true;
                } else {
                    entry.attempt_count += 1;
                    retried += 1;
                    changed = true;
                    kept.push(entry);
                }
            }

            if changed {
                self.rewrite_file(&path, &kept)?;
            }
        }

        Ok((reprocessed, retried))
    }

    fn is_current_file(&self, path: &Path) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|f| f.path == path)
            .unwrap_or(false)
    }

    fn rewrite_file(&self, path: &Path, entries: &[DlqEntry]) -> Result<()> {
        if entries.is_empty() {
            fs::remove_file(path).with_context(|| format!("failed to remove drained DLQ file: {}", path.display()))?;
            return Ok(());
        }

        let tmp_path = path.with_extension("log.tmp");
        {
            let mut handle = File::create(&tmp_path)
                .with_context(|| format!("failed to create temp DLQ file: {}", tmp_path.display()))?;
            for entry in entries {
                let line = serde_json::to_string(entry)?;
                writeln!(handle, "{line}")?;
            }
            handle.sync_data().ok();
        }
        fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename DLQ file into place: {}", path.display()))?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<Vec<DlqEntry>> {
    let file = File::open(path).with_context(|| format!("failed to open DLQ file: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DlqEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable DLQ line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logagent_core::BatchEnvelope;
    use std::collections::HashMap;

    fn entry(sink: &str) -> DlqEntry {
        let envelope = BatchEnvelope::new(sink, vec![]);
        DlqEntry::from_batch(&envelope, "server", "503", HashMap::new())
    }

    fn config(dir: &Path) -> DlqConfig {
        DlqConfig {
            directory: dir.to_path_buf(),
            max_file_size_bytes: 64 * 1024 * 1024,
            retention: Duration::from_secs(7 * 86_400),
            min_entry_age: Duration::from_secs(60),
            max_retries: 5,
        }
    }

    #[test]
    fn enqueue_then_stats_reflects_entry() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::start(config(dir.path())).unwrap();
        dlq.enqueue(&entry("http")).unwrap();
        let stats = dlq.stats().unwrap();
        assert_eq!(stats.entries_total, 1);
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.entries_by_error_kind.get("server"), Some(&1));
    }

    #[test]
    fn rotates_to_new_file_past_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_file_size_bytes = 10;
        let dlq = DeadLetterQueue::start(cfg).unwrap();
        dlq.enqueue(&entry("http")).unwrap();
        dlq.enqueue(&entry("http")).unwrap();
        let stats = dlq.stats().unwrap();
        assert_eq!(stats.file_count, 2);
    }

    #[test]
    fn reprocess_respects_min_age_and_drops_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::start(config(dir.path())).unwrap();
        dlq.enqueue(&entry("http")).unwrap();

        // File is "current" so reprocess_due skips it until rotated past.
        dlq.enqueue(&entry("http")).unwrap();

        let now = Utc::now() + chrono::Duration::seconds(120);
        let (ok, retried) = dlq.reprocess_due(now, |_| true).unwrap();
        assert_eq!(ok + retried, 0, "current file must not be reprocessed");
    }

    #[test]
    fn cleanup_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.retention = Duration::from_secs(0);
        let dlq = DeadLetterQueue::start(cfg).unwrap();
        dlq.enqueue(&entry("http")).unwrap();
        let removed = dlq.cleanup(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dlq.stats().unwrap().file_count, 0);
    }
}
