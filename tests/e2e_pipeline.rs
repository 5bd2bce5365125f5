//! Integration tests that wire the real crates together the way `Agent::build`
//! does, without going through the binary: a `Dispatcher` fanning out to one
//! or more `AdaptiveBatcher`s, each backed by a real `Sink` implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use logagent_batch::{AdaptiveBatcher, BatcherConfig};
use logagent_circuit::{CircuitBreaker, CircuitBreakerConfig};
use logagent_core::{
    ContainerCursor, ContainerStream, FileCursor, Record, SinkError, SinkErrorKind, SourceCursor,
    SourceType,
};
use logagent_dispatcher::{
    Dispatcher, DispatcherConfig, FeedbackGuard, FeedbackGuardConfig, TokenBucket, TokenBucketConfig,
};
use logagent_dlq::{DeadLetterQueue, DlqConfig};
use logagent_position::PositionStore;
use logagent_sinks::http::{AuthMode, BodyCompression, HttpSink, HttpSinkConfig};
use logagent_sinks::local_file::{FileFormat, LocalFileSink, LocalFileSinkConfig};
use logagent_sinks::stream_key::stream_key_of;
use logagent_sinks::Sink;
use logagent_timestamp::{TimestampGuard, TimestampGuardConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn fast_batcher_config(batch_size: usize) -> BatcherConfig {
    BatcherConfig {
        min_batch_size: batch_size,
        initial_batch_size: batch_size,
        max_batch_size: batch_size,
        min_flush_delay: Duration::from_millis(50),
        initial_flush_delay: Duration::from_secs(10),
        max_flush_delay: Duration::from_secs(10),
        adaptation_enabled: false,
        channel_capacity: 1_000,
        worker_count: 1,
        max_retries: 2,
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(40),
        send_timeout: Duration::from_secs(5),
        warning_threshold: 0.75,
        critical_threshold: 0.90,
        emergency_threshold: 0.95,
        ..BatcherConfig::default()
    }
}

fn dispatcher_with(dedup_capacity: usize) -> Dispatcher {
    let feedback_guard = FeedbackGuard::new(FeedbackGuardConfig::default()).unwrap();
    let rate_limiter = TokenBucket::new(TokenBucketConfig { rate_per_sec: 1_000_000.0, burst: 1_000_000.0 });
    let config = DispatcherConfig {
        enqueue_wait: Duration::from_millis(200),
        dedup_ttl: Duration::from_secs(300),
        dedup_capacity,
        dedup_timestamp_bucket_secs: 0,
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(config, feedback_guard, rate_limiter, None);
    dispatcher.start();
    dispatcher
}

/// Binds a tiny Loki-shaped mock server on an ephemeral port; `respond_with`
/// decides the status for each request in sequence.
async fn spawn_mock_loki(responses: Vec<u16>) -> (SocketAddr, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    #[derive(Clone)]
    struct MockState {
        responses: Arc<Vec<u16>>,
        calls: Arc<AtomicUsize>,
    }

    async fn push(State(state): State<MockState>, Json(_body): Json<serde_json::Value>) -> axum::http::StatusCode {
        let idx = state.calls.fetch_add(1, Ordering::SeqCst);
        let code = state.responses.get(idx).copied().unwrap_or(204);
        axum::http::StatusCode::from_u16(code).unwrap()
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let state = MockState { responses: Arc::new(responses), calls: calls.clone() };
    let router = Router::new().route("/loki/api/v1/push", post(push)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, calls, handle)
}

fn http_sink_config(addr: SocketAddr) -> HttpSinkConfig {
    HttpSinkConfig {
        name: "loki".to_string(),
        url: format!("http://{addr}/loki/api/v1/push"),
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
    }
}

fn dlq(dir: &TempDir) -> Arc<DeadLetterQueue> {
    Arc::new(
        DeadLetterQueue::start(DlqConfig {
            directory: dir.path().to_path_buf(),
            max_file_size_bytes: 64 * 1024 * 1024,
            retention: Duration::from_secs(7 * 86_400),
            min_entry_age: Duration::from_secs(60),
            max_retries: 5,
        })
        .unwrap(),
    )
}

/// S1. Happy path, single sink: three records with the same labels, a
/// batcher sized to flush at exactly three, one POST, cursor advances.
#[tokio::test]
async fn happy_path_single_sink_flushes_one_batch() {
    let (addr, calls, _server) = spawn_mock_loki(vec![204]).await;
    let dlq_dir = tempfile::tempdir().unwrap();
    let dlq = dlq(&dlq_dir);

    let guard = TimestampGuard::new(TimestampGuardConfig::default());
    let sink: Arc<dyn Sink> = Arc::new(HttpSink::new(http_sink_config(addr), guard, dlq.clone()).unwrap());
    sink.start().await.unwrap();

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let position_dir = tempfile::tempdir().unwrap();
    let position_store = Arc::new(PositionStore::new(position_dir.path()).unwrap());
    let position_store_hook = position_store.clone();
    let on_success = Arc::new(move |records: &[Record]| {
        for record in records {
            if let Some(cursor) = &record.cursor {
                position_store_hook.commit(&record.source_id, cursor.clone());
            }
        }
    });

    let cancel = CancellationToken::new();
    let (batcher, _handles) =
        AdaptiveBatcher::spawn("loki", fast_batcher_config(3), sink, breaker, dlq.clone(), on_success, cancel.clone());

    let dispatcher = dispatcher_with(10_000);
    dispatcher.add_sink(batcher.clone(), dlq.clone());

    for i in 1..=3u64 {
        let cursor = SourceCursor::File(FileCursor {
            path: "/a".to_string(),
            inode: 1,
            size: 100 * i,
            offset: 100 * i,
            checksum_of_first_n_bytes: "abc".to_string(),
            last_modified: Utc::now(),
        });
        dispatcher
            .handle(
                SourceType::File,
                "/a",
                format!("line_{i}"),
                Some(Utc::now()),
                labels(&[("app", "x")]),
                Some(cursor),
            )
            .await
            .expect("record accepted");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "expected exactly one POST for the full batch");
    assert!(batcher.is_healthy());
    assert_eq!(dlq.stats().unwrap().entries_total, 0, "DLQ must be empty on the happy path");

    let cursor = position_store.load("/a").expect("cursor committed after ack");
    match cursor {
        SourceCursor::File(f) => assert_eq!(f.offset, 300, "cursor advanced past the last acked line"),
        other => panic!("unexpected cursor variant: {other:?}"),
    }

    cancel.cancel();
}

/// S2. A record far outside the acceptable age window never reaches the
/// network; it is dead-lettered with `timestamp_too_old` instead.
#[tokio::test]
async fn timestamp_too_old_is_dead_lettered_not_sent() {
    let (addr, calls, _server) = spawn_mock_loki(vec![204]).await;
    let dlq_dir = tempfile::tempdir().unwrap();
    let dlq = dlq(&dlq_dir);

    let guard = TimestampGuard::new(TimestampGuardConfig {
        initial_max_acceptable_age: Duration::from_secs(24 * 3600),
        ..TimestampGuardConfig::default()
    });
    let sink = HttpSink::new(http_sink_config(addr), guard, dlq.clone()).unwrap();

    let old_record = Record::new(
        SourceType::File,
        "/a",
        "ancient line",
        Utc::now() - chrono::Duration::days(30),
        Utc::now(),
        labels(&[("app", "x")]),
    );

    sink.send(&[old_record]).await.expect("filtered batch is still a successful send");

    assert_eq!(calls.load(Ordering::SeqCst), 0, "rejected record must never be POSTed");
    let stats = dlq.stats().unwrap();
    assert_eq!(stats.entries_total, 1);
    assert_eq!(stats.entries_by_error_kind.get("timestamp_too_old"), Some(&1));
}

/// S3. A sink that fails every attempt exhausts `max_retries` and lands in
/// the DLQ with the true number of send attempts recorded.
#[tokio::test]
async fn exhausted_retries_land_in_dlq_with_correct_attempt_count() {
    let (addr, calls, _server) = spawn_mock_loki(vec![503, 503, 503]).await;
    let dlq_dir = tempfile::tempdir().unwrap();
    let dlq = dlq(&dlq_dir);

    let guard = TimestampGuard::new(TimestampGuardConfig::default());
    let sink: Arc<dyn Sink> = Arc::new(HttpSink::new(http_sink_config(addr), guard, dlq.clone()).unwrap());
    sink.start().await.unwrap();

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let cancel = CancellationToken::new();
    let on_success: logagent_batch::OnSuccess = Arc::new(|_: &[Record]| {});

    let (batcher, _handles) =
        AdaptiveBatcher::spawn("loki", fast_batcher_config(1), sink, breaker.clone(), dlq.clone(), on_success, cancel.clone());

    let dispatcher = dispatcher_with(10_000);
    dispatcher.add_sink(batcher.clone(), dlq.clone());

    dispatcher
        .handle(SourceType::File, "/a", "will fail", Some(Utc::now()), labels(&[("app", "x")]), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus two retries");
    let stats = dlq.stats().unwrap();
    assert_eq!(stats.entries_total, 1);
    assert_eq!(stats.entries_by_error_kind.get("server"), Some(&1));

    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.consecutive_failures, 3, "every failed attempt counts against the breaker");
    assert_eq!(snapshot.state, logagent_core::BreakerState::Closed, "below the default trip threshold of 5");

    cancel.cancel();
}

/// S4. Stream-key derivation is order-independent and stable, not just in
/// a single call but across many, since label maps arrive in arbitrary
/// iteration order from one producer call to the next.
#[tokio::test]
async fn stream_key_is_stable_across_label_orderings() {
    let a = labels(&[("app", "x"), ("env", "prod"), ("svc", "api")]);
    let b = labels(&[("svc", "api"), ("app", "x"), ("env", "prod")]);
    let first = stream_key_of(&a);
    for _ in 0..1000 {
        assert_eq!(stream_key_of(&b), first);
    }
}

/// S5. A file rotation mid-read must finalize the old cursor at its last
/// known offset and let a fresh cursor open at offset 0 on the new inode,
/// with the position store accepting both as forward progress.
#[tokio::test]
async fn file_rotation_advances_cursor_without_rejection() {
    let position_dir = tempfile::tempdir().unwrap();
    let store = PositionStore::new(position_dir.path()).unwrap();

    let before_rotation = SourceCursor::File(FileCursor {
        path: "/var/log/x".to_string(),
        inode: 123,
        size: 1000,
        offset: 800,
        checksum_of_first_n_bytes: "aaa".to_string(),
        last_modified: Utc::now(),
    });
    assert!(store.commit("/var/log/x", before_rotation));

    let finalized = SourceCursor::File(FileCursor {
        path: "/var/log/x".to_string(),
        inode: 123,
        size: 1000,
        offset: 1000,
        checksum_of_first_n_bytes: "aaa".to_string(),
        last_modified: Utc::now(),
    });
    assert!(store.commit("/var/log/x", finalized), "reading to end of the rotated-out file still advances");

    let after_rotation = SourceCursor::File(FileCursor {
        path: "/var/log/x".to_string(),
        inode: 456,
        size: 0,
        offset: 0,
        checksum_of_first_n_bytes: "bbb".to_string(),
        last_modified: Utc::now(),
    });
    assert!(store.commit("/var/log/x", after_rotation), "a new inode always advances past the old one");

    match store.load("/var/log/x").unwrap() {
        SourceCursor::File(f) => assert_eq!(f.inode, 456),
        other => panic!("unexpected cursor variant: {other:?}"),
    }
}

/// S6. `Stop()` on a dispatcher whose only sink is unreachable returns
/// within a bounded deadline, and the in-flight records it aborted land
/// in the DLQ rather than being silently lost.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_work_within_deadline() {
    struct UnreachableSink;

    #[async_trait]
    impl Sink for UnreachableSink {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send(&self, _records: &[Record]) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SinkError::new(SinkErrorKind::Temporary, "unreachable"))
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            false
        }
    }

    let dlq_dir = tempfile::tempdir().unwrap();
    let dlq = dlq(&dlq_dir);
    let sink: Arc<dyn Sink> = Arc::new(UnreachableSink);
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let cancel = CancellationToken::new();
    let on_success: logagent_batch::OnSuccess = Arc::new(|_: &[Record]| {});

    let mut config = fast_batcher_config(1);
    config.send_timeout = Duration::from_secs(60);
    let (batcher, handles) = AdaptiveBatcher::spawn("unreachable", config, sink, breaker, dlq.clone(), on_success, cancel.clone());

    let dispatcher = Arc::new(dispatcher_with(10_000));
    dispatcher.add_sink(batcher.clone(), dlq.clone());

    for i in 0..20 {
        let _ = dispatcher
            .handle(SourceType::File, "/busy", format!("line_{i}"), Some(Utc::now()), HashMap::new(), None)
            .await;
    }

    let stopped = tokio::time::timeout(Duration::from_secs(12), async {
        dispatcher.stop();
        cancel.cancel();
        handles.assembly.await.ok();
        for worker in handles.workers {
            worker.await.ok();
        }
    })
    .await;

    assert!(stopped.is_ok(), "Stop() must return within the bounded drain deadline");

    let dlq_entries = dlq.stats().unwrap().entries_total;
    assert!(dlq_entries > 0, "records in flight when Stop() cancelled the send must be dead-lettered, not dropped");

    let record = Record::new(SourceType::File, "/busy", "late", Utc::now(), Utc::now(), HashMap::new());
    let rejected = dispatcher
        .handle(SourceType::File, "/busy", "after shutdown", Some(Utc::now()), HashMap::new(), None)
        .await;
    assert!(rejected.is_err(), "dispatcher must refuse new work once stopped");
    drop(record);
}

/// Records delivered to two different sinks (local file and HTTP) from a
/// single `Dispatcher::handle` call both see the same content, independent
/// deep copies rather than shared state.
#[tokio::test]
async fn fan_out_delivers_independent_copies_to_every_sink() {
    let (addr, calls, _server) = spawn_mock_loki(vec![204]).await;
    let http_dlq_dir = tempfile::tempdir().unwrap();
    let http_dlq = dlq(&http_dlq_dir);
    let guard = TimestampGuard::new(TimestampGuardConfig::default());
    let http_sink: Arc<dyn Sink> = Arc::new(HttpSink::new(http_sink_config(addr), guard, http_dlq.clone()).unwrap());
    http_sink.start().await.unwrap();

    let file_dir = tempfile::tempdir().unwrap();
    let file_dlq_dir = tempfile::tempdir().unwrap();
    let file_dlq = dlq(&file_dlq_dir);
    let file_sink: Arc<dyn Sink> = Arc::new(
        LocalFileSink::new(LocalFileSinkConfig {
            name: "disk".to_string(),
            directory: file_dir.path().to_path_buf(),
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
            retention: Duration::from_secs(7 * 86_400),
            format: FileFormat::Json,
            text_template: None,
            disk_warning_pct: 0.15,
            disk_critical_pct: 0.05,
        })
        .unwrap(),
    );
    file_sink.start().await.unwrap();

    let cancel = CancellationToken::new();
    let on_success_http: logagent_batch::OnSuccess = Arc::new(|_: &[Record]| {});
    let on_success_file: logagent_batch::OnSuccess = Arc::new(|_: &[Record]| {});

    let (http_batcher, _h1) = AdaptiveBatcher::spawn(
        "loki",
        fast_batcher_config(1),
        http_sink,
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        http_dlq.clone(),
        on_success_http,
        cancel.clone(),
    );
    let (file_batcher, _h2) = AdaptiveBatcher::spawn(
        "disk",
        fast_batcher_config(1),
        file_sink,
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        file_dlq.clone(),
        on_success_file,
        cancel.clone(),
    );

    let dispatcher = dispatcher_with(10_000);
    dispatcher.add_sink(http_batcher.clone(), http_dlq.clone());
    dispatcher.add_sink(file_batcher.clone(), file_dlq.clone());

    dispatcher
        .handle(
            SourceType::Container,
            "my-container",
            "hello from both sinks",
            Some(Utc::now()),
            labels(&[("app", "x")]),
            Some(SourceCursor::Container(ContainerCursor {
                container_id: "c1".to_string(),
                container_name: "my-container".to_string(),
                stream: ContainerStream::Stdout,
                last_timestamp: Utc::now(),
            })),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "HTTP sink received its copy");
    let written: Vec<PathBuf> = std::fs::read_dir(file_dir.path())
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    assert!(!written.is_empty(), "local-file sink received its copy");

    cancel.cancel();
}
