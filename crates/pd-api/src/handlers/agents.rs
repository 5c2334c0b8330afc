//! `/agents` and `/resurrection` — registration, heartbeats, inboxes, and
//! the dead-agent salvage flow.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;

use pd_core::types::AgentStatus;
use pd_agents::RegisterRequest;

use super::caller_agent;
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

pub async fn register(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.agents.register(req).await?;
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentsQuery {
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AgentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            AgentStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
    };
    let agents = state.agents.list(status).await?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = state
        .agents
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent not found: {id}")))?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

pub async fn unregister(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.agents.unregister(&id).await?;
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}

pub async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = state.agents.heartbeat(&id).await?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct InboxQuery {
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<i64>,
}

pub async fn inbox_list(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = state.inbox.list(&id, query.unread, query.limit).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct InboxPostBody {
    pub content: String,
    pub sender: Option<String>,
}

pub async fn inbox_post(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<InboxPostBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }
    let sender = body.sender.or_else(|| caller_agent(&headers));
    let message = state.inbox.post(&id, &body.content, sender).await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

pub async fn inbox_read_all(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let marked = state.inbox.mark_all_read(&id).await?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}

pub async fn inbox_clear(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cleared = state.inbox.clear(&id).await?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

pub async fn inbox_stats(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.inbox.stats(&id).await?;
    Ok(Json(serde_json::to_value(&stats).unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// Resurrection
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PendingQuery {
    pub project: Option<String>,
}

pub async fn resurrection_pending(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.resurrection.pending(query.project).await?;
    Ok(Json(serde_json::json!({ "pending": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    pub new_agent_id: String,
}

pub async fn resurrection_claim(
    State(state): State<Arc<ApiState>>,
    Path(old_id): Path<String>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = state
        .resurrection
        .claim(&old_id, &body.new_agent_id)
        .await?;
    Ok(Json(serde_json::json!({ "entry": entry })))
}

pub async fn resurrection_complete(
    State(state): State<Arc<ApiState>>,
    Path(old_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = state.resurrection.complete(&old_id).await?;
    Ok(Json(serde_json::json!({ "entry": entry })))
}

pub async fn resurrection_abandon(
    State(state): State<Arc<ApiState>>,
    Path(old_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = state.resurrection.abandon(&old_id).await?;
    Ok(Json(serde_json::json!({ "entry": entry })))
}

pub async fn resurrection_dismiss(
    State(state): State<Arc<ApiState>>,
    Path(old_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = state.resurrection.dismiss(&old_id).await?;
    Ok(Json(serde_json::json!({ "entry": entry })))
}
