//! Minimal admin/observability HTTP surface: `/health`, `/stats`,
//! `/positions`, `/dlq/stats`. Not part of the ingestion path — an operator
//! or monitoring agent polls this, producers never touch it.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::agent::Agent;

#[derive(Clone)]
pub struct AdminState {
    pub agent: Arc<tokio::sync::RwLock<Agent>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/positions", get(positions))
        .route("/dlq/stats", get(dlq_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct AdminError(anyhow::Error);

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AdminError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let agent = state.agent.read().await;
    let all_healthy = agent.batchers().values().all(|b| b.is_healthy());
    let status = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "status": if all_healthy { "healthy" } else { "degraded" } })))
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    let agent = state.agent.read().await;
    let dispatcher_stats = agent.dispatcher().stats();

    let sinks: serde_json::Value = agent
        .batchers()
        .iter()
        .map(|(name, batcher)| {
            let batch_stats = batcher.stats();
            let circuit = batcher.circuit_snapshot();
            (
                name.clone(),
                json!({
                    "enqueued": batch_stats.enqueued,
                    "sent_ok": batch_stats.sent_ok,
                    "sent_failed": batch_stats.sent_failed,
                    "retried": batch_stats.retried,
                    "dlq_routed": batch_stats.dlq_routed,
                    "circuit_blocked": batch_stats.circuit_blocked,
                    "queue_full_rejections": batch_stats.queue_full_rejections,
                    "current_batch_size": batch_stats.current_batch_size,
                    "current_flush_delay_ms": batch_stats.current_flush_delay_ms,
                    "queue_depth": batch_stats.queue_depth,
                    "queue_capacity": batch_stats.queue_capacity,
                    "is_healthy": batcher.is_healthy(),
                    "circuit_state": circuit.state.to_string(),
                    "circuit_consecutive_failures": circuit.consecutive_failures,
                }),
            )
        })
        .collect();

    Json(json!({
        "dispatcher": {
            "total_accepted": dispatcher_stats.total_accepted,
            "drop_reasons": dispatcher_stats.drop_reasons,
            "per_sink_enqueued": dispatcher_stats.per_sink_enqueued,
            "dedup_hits": dispatcher_stats.dedup_hits,
            "throttled": dispatcher_stats.throttled,
            "transform_errors": dispatcher_stats.transform_errors,
        },
        "sinks": sinks,
    }))
}

async fn positions(State(state): State<AdminState>) -> impl IntoResponse {
    let agent = state.agent.read().await;
    let snapshot = agent.position_store().snapshot();
    Json(json!({ "positions": snapshot }))
}

async fn dlq_stats(State(state): State<AdminState>) -> Result<impl IntoResponse, AdminError> {
    let agent = state.agent.read().await;
    let mut per_sink = serde_json::Map::new();
    for (name, dlq) in agent.dlqs() {
        let stats = dlq.stats()?;
        per_sink.insert(
            name.clone(),
            json!({
                "file_count": stats.file_count,
                "total_bytes": stats.total_bytes,
                "entries_total": stats.entries_total,
                "entries_by_error_kind": stats.entries_by_error_kind,
            }),
        );
    }
    Ok(Json(json!({ "dlq": per_sink })))
}
