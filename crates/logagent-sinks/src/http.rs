//! HTTP (Loki-style) sink. Groups records into streams by label set,
//! POSTs a JSON push body, and classifies the response per the sink's
//! documented status-code contract.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use logagent_core::{DlqEntry, Record, RejectKind, SinkError, SinkErrorKind};
use logagent_dlq::DeadLetterQueue;
use logagent_timestamp::TimestampGuard;
use metrics::counter;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{info, warn};

use crate::sink::Sink;
use crate::stream_key::stream_key_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Basic,
    Bearer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCompression {
    None,
    Gzip,
    /// Accepted by config for forward-compatibility; not wired to an
    /// actual encoder (no grounded snappy crate in the surrounding stack),
    /// so requests fall back to uncompressed bodies with a one-time log.
    Snappy,
}

pub struct HttpSinkConfig {
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub auth: AuthMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    pub tenant_header: Option<String>,
    pub tenant_id: Option<String>,
    pub compression: BodyCompression,
    pub request_timeout: Duration,
}

pub struct HttpSink {
    config: HttpSinkConfig,
    client: Client,
    guard: TimestampGuard,
    dlq: Arc<DeadLetterQueue>,
    healthy: Mutex<bool>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig, guard: TimestampGuard, dlq: Arc<DeadLetterQueue>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { config, client, guard, dlq, healthy: Mutex::new(true) })
    }

    /// Routes a single record the guard rejected pre-send straight to the
    /// DLQ, as its own one-record envelope, so a filtered record still
    /// satisfies at-least-once (ack or DLQEntry) even though it never
    /// reaches `Sink::send`'s network path.
    fn route_rejected_to_dlq(&self, record: &Record, reject: RejectKind) {
        let kind = match reject {
            RejectKind::TooOld => "timestamp_too_old",
            RejectKind::TooNew => "timestamp_too_new",
            RejectKind::Zero => "timestamp_zero",
        };
        counter!("logagent.timestamp_guard.dlq_routed", 1, "kind" => kind);
        let envelope = logagent_core::BatchEnvelope::new(self.config.name.clone(), vec![record.deep_copy()]);
        let entry = DlqEntry::from_batch(&envelope, kind, "rejected by timestamp guard before send", HashMap::new());
        if let Err(err) = self.dlq.enqueue(&entry) {
            warn!(sink = self.config.name, error = %err, "failed to dead-letter a timestamp-rejected record");
        }
    }

    fn build_push_body(&self, records: &[Record]) -> serde_json::Value {
        let mut streams: HashMap<String, (HashMap<String, String>, Vec<[String; 2]>)> = HashMap::new();

        for record in records {
            let labels = record.labels_snapshot();
            let key = stream_key_of(&labels);
            let entry = streams.entry(key).or_insert_with(|| (labels.clone(), Vec::new()));
            let ts_ns = record.timestamp.timestamp_nanos_opt().unwrap_or(0).to_string();
            entry.1.push([ts_ns, record.message.clone()]);
        }

        let stream_objs: Vec<serde_json::Value> = streams
            .into_values()
            .map(|(labels, values)| json!({ "stream": labels, "values": values }))
            .collect();

        json!({ "streams": stream_objs })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.auth {
            AuthMode::None => request,
            AuthMode::Basic => {
                let user = self.config.username.clone().unwrap_or_default();
                request.basic_auth(user, self.config.password.clone())
            }
            AuthMode::Bearer => {
                let token = self.config.bearer_token.clone().unwrap_or_default();
                request.bearer_auth(token)
            }
        }
    }

    fn compress_body(&self, body: &[u8]) -> anyhow::Result<(Vec<u8>, Option<&'static str>)> {
        match self.config.compression {
            BodyCompression::None => Ok((body.to_vec(), None)),
            BodyCompression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                Ok((encoder.finish()?, Some("gzip")))
            }
            BodyCompression::Snappy => {
                warn!(sink = self.config.name, "snappy compression requested but not wired; sending uncompressed");
                Ok((body.to_vec(), None))
            }
        }
    }

    fn classify_response(&self, status: StatusCode, body: &str, retry_after: Option<Duration>) -> Option<SinkError> {
        if status.is_success() {
            return None;
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let mut err = SinkError::new(SinkErrorKind::RateLimit, format!("429: {body}"));
            if let Some(ra) = retry_after {
                err = err.with_retry_after(ra);
            }
            return Some(err);
        }

        if status.is_server_error() {
            return Some(SinkError::new(SinkErrorKind::Server, format!("{status}: {body}")));
        }

        if status == StatusCode::BAD_REQUEST && looks_like_timestamp_rejection(body) {
            return Some(SinkError::new(SinkErrorKind::TimestampTooOld, format!("{status}: {body}")));
        }

        Some(SinkError::new(SinkErrorKind::Permanent, format!("{status}: {body}")))
    }
}

fn looks_like_timestamp_rejection(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("too far behind") || lower.contains("timestamp") && lower.contains("old")
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!(sink = self.config.name, url = self.config.url, "http sink started");
        Ok(())
    }

    async fn send(&self, records: &[Record]) -> Result<(), SinkError> {
        let now = Utc::now();
        let mut accepted: Vec<Record> = Vec::with_capacity(records.len());
        for record in records {
            match self.guard.validate(record.timestamp, now) {
                Ok(()) => accepted.push(record.clone()),
                Err(reject) => self.route_rejected_to_dlq(record, reject),
            }
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let body = self.build_push_body(&accepted);
        let raw = serde_json::to_vec(&body).map_err(|e| SinkError::new(SinkErrorKind::Permanent, e.to_string()))?;
        let (payload, encoding) = self
            .compress_body(&raw)
            .map_err(|e| SinkError::new(SinkErrorKind::Temporary, e.to_string()))?;

        let mut request = self
            .client
            .request(
                self.config.method.parse().unwrap_or(reqwest::Method::POST),
                &self.config.url,
            )
            .header("Content-Type", "application/json");

        if let Some(encoding) = encoding {
            request = request.header("Content-Encoding", encoding);
        }
        for (k, v) in &self.config.headers {
            request = request.header(k, v);
        }
        if let (Some(header), Some(tenant)) = (&self.config.tenant_header, &self.config.tenant_id) {
            request = request.header(header.as_str(), tenant.as_str());
        }
        request = self.apply_auth(request);
        request = request.body(payload);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                *self.healthy.lock() = false;
                return Err(SinkError::new(SinkErrorKind::Temporary, e.to_string()));
            }
            Err(e) => {
                *self.healthy.lock() = false;
                return Err(SinkError::new(SinkErrorKind::Temporary, e.to_string()));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body_text = response.text().await.unwrap_or_default();

        match self.classify_response(status, &body_text, retry_after) {
            None => {
                *self.healthy.lock() = true;
                Ok(())
            }
            Some(err) => {
                *self.healthy.lock() = false;
                if err.kind == SinkErrorKind::TimestampTooOld {
                    self.guard.learn(&err.message, now);
                }
                Err(err)
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logagent_core::SourceType;
    use logagent_timestamp::TimestampGuardConfig;

    fn record(msg: &str, labels: &[(&str, &str)]) -> Record {
        let now = Utc::now();
        let mut map = HashMap::new();
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        Record::new(SourceType::File, "/a".to_string(), msg.to_string(), now, now, map)
    }

    fn sink() -> (HttpSink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(
            DeadLetterQueue::start(logagent_dlq::DlqConfig {
                directory: dir.path().to_path_buf(),
                ..logagent_dlq::DlqConfig::default()
            })
            .unwrap(),
        );
        let config = HttpSinkConfig {
            name: "loki".to_string(),
            url: "http://localhost:1/loki/api/v1/push".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            auth: AuthMode::None,
            username: None,
            password: None,
            bearer_token: None,
            tenant_header: None,
            tenant_id: None,
            compression: BodyCompression::None,
            request_timeout: Duration::from_secs(5),
        };
        let sink = HttpSink::new(config, TimestampGuard::new(TimestampGuardConfig::default()), dlq).unwrap();
        (sink, dir)
    }

    #[test]
    fn build_push_body_groups_by_stream_key() {
        let (sink, _dir) = sink();
        let records = vec![
            record("a", &[("app", "x")]),
            record("b", &[("app", "x")]),
            record("c", &[("app", "y")]),
        ];
        let body = sink.build_push_body(&records);
        let streams = body["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 2);
    }

    #[test]
    fn classifies_status_codes() {
        let (sink, _dir) = sink();
        assert!(sink.classify_response(StatusCode::NO_CONTENT, "", None).is_none());
        assert_eq!(
            sink.classify_response(StatusCode::TOO_MANY_REQUESTS, "", None).unwrap().kind,
            SinkErrorKind::RateLimit
        );
        assert_eq!(
            sink.classify_response(StatusCode::SERVICE_UNAVAILABLE, "", None).unwrap().kind,
            SinkErrorKind::Server
        );
        assert_eq!(
            sink.classify_response(StatusCode::BAD_REQUEST, "entry too far behind", None).unwrap().kind,
            SinkErrorKind::TimestampTooOld
        );
        assert_eq!(
            sink.classify_response(StatusCode::BAD_REQUEST, "malformed json", None).unwrap().kind,
            SinkErrorKind::Permanent
        );
        assert_eq!(
            sink.classify_response(StatusCode::NOT_FOUND, "", None).unwrap().kind,
            SinkErrorKind::Permanent
        );
    }

    #[tokio::test]
    async fn empty_batch_after_timestamp_filtering_is_success() {
        let (sink, _dir) = sink();
        let old_record = record("old", &[("app", "x")]);
        let mut old_record = old_record;
        old_record.timestamp = Utc::now() - chrono::Duration::days(30);
        let result = sink.send(&[old_record]).await;
        assert!(result.is_ok(), "fully filtered batch must be treated as a success with zero sends");
    }

    #[tokio::test]
    async fn filtered_record_lands_in_dlq_not_silently_dropped() {
        let (sink, dir) = sink();
        let mut old_record = record("old", &[("app", "x")]);
        old_record.timestamp = Utc::now() - chrono::Duration::days(30);
        sink.send(&[old_record]).await.unwrap();

        let stats = sink.dlq.stats().unwrap();
        assert_eq!(stats.entries_total, 1, "timestamp-rejected record must be dead-lettered, not dropped");
        assert_eq!(stats.entries_by_error_kind.get("timestamp_too_old"), Some(&1));
        drop(dir);
    }
}
