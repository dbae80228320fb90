//! Liveness and readiness surface
//!
//! Small HTTP sidecar for orchestration and scraping: `/health`
//! answers as long as the process runs, `/ready` flips once any shard
//! is serving dispatches, and `/metrics` renders the shared Prometheus
//! registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::metrics::GatewayMetrics;
use crate::shard::ShardStatusMap;

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: ShardStatusMap,
    pub metrics: Arc<GatewayMetrics>,
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub version: &'static str,
}

/// Body of `/ready`.
#[derive(Debug, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub shards_ready: usize,
    pub shards_total: usize,
    pub events_received: u64,
    pub reconnects: u64,
}

impl Readiness {
    fn from_status(status: &ShardStatusMap) -> Self {
        let snapshot = status.snapshot();
        Self {
            ready: snapshot.is_ready(),
            shards_ready: snapshot.shards_ready,
            shards_total: snapshot.shards_total,
            events_received: snapshot.events_received,
            reconnects: snapshot.reconnects,
        }
    }
}

/// Router over the three endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// The process is up; says nothing about shard state.
async fn health() -> Json<Liveness> {
    Json(Liveness {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// 200 once any shard is serving, 503 before the first READY and
/// during a full outage. Orchestrators gate traffic on this.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let body = Readiness::from_status(&state.status);
    let code = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Prometheus text render of the shared registry. Gauges derived from
/// shard status are refreshed at scrape time.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_shards_ready(state.status.snapshot().shards_ready);

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
