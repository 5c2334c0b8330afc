//! `/locks` — named advisory locks.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;

use pd_core::types::Lock;

use super::{caller_agent, caller_pid};
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

const DEFAULT_TTL_MS: i64 = 60_000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireBody {
    pub owner: Option<String>,
    pub ttl: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

fn resolve_owner(body_owner: Option<String>, headers: &HeaderMap) -> Result<String, ApiError> {
    body_owner
        .or_else(|| caller_agent(headers))
        .ok_or_else(|| ApiError::BadRequest("owner is required (body or X-Agent-Id)".into()))
}

pub async fn acquire(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AcquireBody>,
) -> Result<Json<Lock>, ApiError> {
    let owner = resolve_owner(body.owner, &headers)?;
    let lock = state
        .locks
        .acquire(
            &name,
            &owner,
            caller_pid(&headers),
            body.ttl.unwrap_or(DEFAULT_TTL_MS),
            body.metadata,
        )
        .await?;
    Ok(Json(lock))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseBody {
    pub owner: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn release(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReleaseBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = resolve_owner(body.owner, &headers)?;
    state.locks.release(&name, &owner, body.force).await?;
    Ok(Json(serde_json::json!({ "released": true, "name": name })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendBody {
    pub owner: Option<String>,
    pub ttl: Option<i64>,
    #[serde(default)]
    pub force: bool,
}

pub async fn extend(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExtendBody>,
) -> Result<Json<Lock>, ApiError> {
    let owner = resolve_owner(body.owner, &headers)?;
    let lock = state
        .locks
        .extend(&name, &owner, body.ttl.unwrap_or(DEFAULT_TTL_MS), body.force)
        .await?;
    Ok(Json(lock))
}

pub async fn check(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lock = state.locks.check(&name).await?;
    Ok(Json(serde_json::json!({ "lock": lock })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let locks = state.locks.list(query.owner).await?;
    Ok(Json(serde_json::json!({ "locks": locks })))
}
