//! HTTP surface of a control-plane member
//!
//! - `GET /pd/ping`: liveness probe used by peers' health checks
//! - `GET /pd/status`: cluster id, leadership and lifecycle state
//! - `GET /metrics`: Prometheus text

use crate::common::utils::format_nanos;
use crate::common::METRICS;
use crate::coordinator::health::HEALTH_PATH;
use crate::coordinator::server::Server;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub fn create_router(server: Arc<Server>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(ping))
        .route("/pd/status", get(status))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(server)
}

async fn ping(State(server): State<Arc<Server>>) -> impl IntoResponse {
    if server.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(server): State<Arc<Server>>) -> impl IntoResponse {
    let leader = server.leader().map(|l| l.name.clone());
    let cluster = match server.cluster_status().await {
        Ok(status) => json!({
            "is_initialized": status.is_initialized,
            "raft_bootstrap_time": status.raft_bootstrap_time.map(format_nanos),
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    axum::Json(json!({
        "name": server.member().name,
        "member_id": server.member().member_id,
        "cluster_id": server.cluster_id(),
        "is_leader": server.is_leader(),
        "leader": leader,
        "cluster_running": server.is_cluster_running(),
        "cluster": cluster,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
