//! Rotating local-file sink. One writer per output file; compression, if
//! any, happens only at rotation — never in the per-line hot path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use logagent_core::{Record, SinkError, SinkErrorKind};
use parking_lot::Mutex;
use sysinfo::Disks;
use tracing::{info, warn};

use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct LocalFileSinkConfig {
    pub name: String,
    pub directory: PathBuf,
    pub max_size_bytes: u64,
    pub max_files: u32,
    pub retention: Duration,
    pub format: FileFormat,
    pub text_template: Option<String>,
    pub disk_warning_pct: f64,
    pub disk_critical_pct: f64,
}

struct Writer {
    path: PathBuf,
    file: File,
    size: u64,
    opened_on: NaiveDate,
}

pub struct LocalFileSink {
    config: LocalFileSinkConfig,
    writer: Mutex<Option<Writer>>,
    healthy: Mutex<bool>,
}

impl LocalFileSink {
    pub fn new(config: LocalFileSinkConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.directory)?;
        Ok(Self { config, writer: Mutex::new(None), healthy: Mutex::new(true) })
    }

    fn disk_usage_pct_free(&self) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let target = self.config.directory.canonicalize().ok()?;
        let mount = disks
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = mount.total_space();
        if total == 0 {
            return None;
        }
        Some(mount.available_space() as f64 / total as f64)
    }

    fn render_line(&self, record: &Record) -> String {
        match self.config.format {
            FileFormat::Json => {
                let snapshot = logagent_core::RecordSnapshot::from(record);
                serde_json::to_string(&snapshot).unwrap_or_default()
            }
            FileFormat::Text => {
                let template = self.config.text_template.as_deref().unwrap_or("{message}");
                template
                    .replace("{message}", &record.message)
                    .replace("{level}", record.level.as_str())
                    .replace("{source_id}", &record.source_id)
                    .replace("{timestamp}", &record.timestamp.to_rfc3339())
            }
        }
    }

    fn ensure_writer(&self, writer_guard: &mut Option<Writer>) -> anyhow::Result<()> {
        let today = Utc::now().date_naive();
        let needs_new = match writer_guard.as_ref() {
            None => true,
            Some(w) => w.size >= self.config.max_size_bytes || w.opened_on != today,
        };

        if needs_new {
            if let Some(old) = writer_guard.take() {
                self.rotate(old)?;
            }
            let path = self.config.directory.join(format!(
                "{}_{}.log",
                self.config.name,
                Utc::now().format("%Y%m%d_%H%M%S")
            ));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *writer_guard = Some(Writer { path, file, size: 0, opened_on: today });
        }

        Ok(())
    }

    fn rotate(&self, mut writer: Writer) -> anyhow::Result<()> {
        writer.file.sync_all().ok();
        drop(writer.file);

        let gz_path = writer.path.with_extension("log.gz");
        let raw = fs::read(&writer.path)?;
        let gz_file = File::create(&gz_path)?;
        let mut encoder = GzEncoder::new(gz_file, Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?;
        fs::remove_file(&writer.path)?;

        self.enforce_retention()?;
        Ok(())
    }

    fn enforce_retention(&self) -> anyhow::Result<()> {
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.config.directory)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "gz").unwrap_or(false))
            .collect();
        rotated.sort();

        while rotated.len() as u32 > self.config.max_files {
            let oldest = rotated.remove(0);
            fs::remove_file(&oldest).ok();
        }

        let now = Utc::now();
        for path in &rotated {
            if let Ok(metadata) = fs::metadata(path) {
                if let Ok(modified) = metadata.modified() {
                    let modified: chrono::DateTime<Utc> = modified.into();
                    if (now - modified).to_std().unwrap_or(Duration::ZERO) > self.config.retention {
                        fs::remove_file(path).ok();
                    }
                }
            }
        }
        Ok(())
    }

    fn emergency_cleanup(&self) -> anyhow::Result<()> {
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.config.directory)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "gz").unwrap_or(false))
            .collect();
        rotated.sort();
        if let Some(oldest) = rotated.first() {
            warn!(path = %oldest.display(), "disk critical: removing oldest rotated file");
            fs::remove_file(oldest).ok();
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for LocalFileSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!(sink = self.config.name, "local file sink started");
        Ok(())
    }

    async fn send(&self, records: &[Record]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        if let Some(free_pct) = self.disk_usage_pct_free() {
            if free_pct < self.config.disk_critical_pct {
                self.emergency_cleanup().map_err(|e| SinkError::new(SinkErrorKind::Temporary, e.to_string()))?;
                if self.disk_usage_pct_free().unwrap_or(1.0) < self.config.disk_critical_pct {
                    *self.healthy.lock() = false;
                    return Err(SinkError::new(
                        SinkErrorKind::Permanent,
                        "disk usage still critical after emergency cleanup",
                    ));
                }
            } else if free_pct < self.config.disk_warning_pct {
                *self.healthy.lock() = false;
                return Err(SinkError::new(SinkErrorKind::Temporary, "disk usage below warning threshold")
                    .with_retry_after(Duration::from_secs(5)));
            }
        }

        let lines: Vec<String> = records.iter().map(|r| self.render_line(r)).collect();

        let mut writer_guard = self.writer.lock();
        self.ensure_writer(&mut writer_guard)
            .map_err(|e| SinkError::new(SinkErrorKind::Temporary, e.to_string()))?;
        let writer = writer_guard.as_mut().expect("ensure_writer populates this");

        for line in &lines {
            writeln!(writer.file, "{line}")
                .map_err(|e| SinkError::new(SinkErrorKind::Temporary, e.to_string()))?;
            writer.size += line.len() as u64 + 1;
        }
        writer.file.sync_data().ok();

        *self.healthy.lock() = true;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut writer_guard = self.writer.lock();
        if let Some(writer) = writer_guard.as_mut() {
            writer.file.sync_all().ok();
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use logagent_core::SourceType;

    fn record(msg: &str) -> Record {
        let now = Utc::now();
        Record::new(SourceType::File, "/a".to_string(), msg.to_string(), now, now, Default::default())
    }

    fn config(dir: &Path) -> LocalFileSinkConfig {
        LocalFileSinkConfig {
            name: "disk".to_string(),
            directory: dir.to_path_buf(),
            max_size_bytes: 1024 * 1024,
            max_files: 5,
            retention: Duration::from_secs(7 * 86_400),
            format: FileFormat::Json,
            text_template: None,
            disk_warning_pct: 0.0,
            disk_critical_pct: 0.0,
        }
    }

    #[tokio::test]
    async fn send_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalFileSink::new(config(dir.path())).unwrap();
        sink.send(&[record("hello"), record("world")]).await.unwrap();

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(files[0].path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn rotation_compresses_and_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_size_bytes = 1;
        let sink = LocalFileSink::new(cfg).unwrap();
        sink.send(&[record("first")]).await.unwrap();
        sink.send(&[record("second")]).await.unwrap();

        let gz_count = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "gz").unwrap_or(false))
            .count();
        assert_eq!(gz_count, 1, "first file should have rotated and compressed");
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op_success() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalFileSink::new(config(dir.path())).unwrap();
        assert!(sink.send(&[]).await.is_ok());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
