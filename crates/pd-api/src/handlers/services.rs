//! `/claim`, `/release`, `/services` and endpoint management.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;

use pd_core::types::ServiceStatus;
use pd_registry::{ClaimOutcome, ClaimRequest, ReleaseOutcome, ReleaseRequest, ServiceFilter};

use super::{caller_agent, caller_pid};
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

pub async fn claim(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(mut req): Json<ClaimRequest>,
) -> Result<Json<ClaimOutcome>, ApiError> {
    req.pid = caller_pid(&headers);
    req.agent_id = caller_agent(&headers);
    let outcome = state.services.claim(req).await?;
    Ok(Json(outcome))
}

pub async fn release(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseOutcome>, ApiError> {
    let outcome = state.services.release(req).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct ServicesQuery {
    pub pattern: Option<String>,
    pub status: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub expired: bool,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ServicesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            ServiceStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
    };
    let services = state
        .services
        .find(ServiceFilter {
            pattern: query.pattern,
            status,
            port: query.port,
            expired: query.expired,
        })
        .await?;
    Ok(Json(serde_json::json!({ "services": services })))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let service = state
        .services
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("service not found: {id}")))?;
    let endpoints = state.services.endpoints(&id).await?;
    Ok(Json(serde_json::json!({
        "service": service,
        "endpoints": endpoints,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EndpointBody {
    pub url: String,
}

pub async fn set_endpoint(
    State(state): State<Arc<ApiState>>,
    Path((id, env)): Path<(String, String)>,
    Json(body): Json<EndpointBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let endpoint = state.services.set_endpoint(&id, &env, &body.url).await?;
    Ok(Json(serde_json::json!({ "endpoint": endpoint })))
}

pub async fn endpoints(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let endpoints = state.services.endpoints(&id).await?;
    Ok(Json(serde_json::json!({ "endpoints": endpoints })))
}
