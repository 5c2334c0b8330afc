//! Diagnostics and port views: `/health`, `/version`, `/metrics`,
//! `/config`, `/ports/*`.

use std::sync::Arc;

use axum::extract::State;

use pd_registry::ServiceFilter;
use pd_telemetry::metrics::{table_counts, MetricsSnapshot};

use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

pub async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn version(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "codeHash": state.code_hash,
        "pid": std::process::id(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn metrics(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    let tables = table_counts(&state.store).await?;
    let (long_poll, stream) = state.connections.totals();
    Ok(Json(MetricsSnapshot {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tables,
        long_poll_connections: long_poll,
        stream_connections: stream,
        webhook_queue_depth: state.deliveries.queue_depth(),
        reaper_passes: state.reaper_stats.passes(),
        last_reaper_pass_at: state.reaper_stats.last_pass_ms(),
    }))
}

pub async fn config(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(&state.config).unwrap_or_default())
}

/// Force one reaper pass.
pub async fn ports_cleanup(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cleanup.run_pass().await.map(Json).map_err(ApiError::Internal)
}

/// The database's view: services holding ports.
pub async fn ports_active(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services = state.services.find(ServiceFilter::default()).await?;
    let ports: Vec<serde_json::Value> = services
        .iter()
        .filter_map(|s| {
            s.port.map(|port| {
                serde_json::json!({
                    "port": port,
                    "id": s.id,
                    "pid": s.pid,
                    "status": s.status,
                    "lastSeen": s.last_seen,
                })
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "ports": ports })))
}

/// The OS's view: every TCP listener on the machine.
pub async fn ports_system(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let listeners = state
        .probe
        .listeners()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "listeners": listeners })))
}
