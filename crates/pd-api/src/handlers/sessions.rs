//! `/sessions` and `/notes` — structured work sessions, file claims, and
//! quick notes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;

use pd_core::types::SessionStatus;

use super::caller_agent;
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub purpose: String,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn start(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent_id = body.agent_id.or_else(|| caller_agent(&headers));
    let outcome = state
        .sessions
        .start(&body.purpose, agent_id, body.files, body.force)
        .await?;
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsQuery {
    pub status: Option<String>,
    pub agent_id: Option<String>,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
    };
    let sessions = state.sessions.list(status, query.agent_id).await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;
    let files = state.sessions.files(&id).await?;
    Ok(Json(serde_json::json!({ "session": session, "files": files })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub status: String,
}

pub async fn update(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = SessionStatus::parse(&body.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", body.status)))?;
    let session = state.sessions.update(&id, status).await?;
    Ok(Json(serde_json::json!({ "session": session })))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sessions.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

pub async fn add_note(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<NoteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }
    let note = state.sessions.add_note(&id, &body.content, body.kind).await?;
    Ok(Json(serde_json::json!({ "note": note })))
}

#[derive(Debug, Default, Deserialize)]
pub struct NotesQuery {
    pub limit: Option<i64>,
}

pub async fn notes(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<NotesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let notes = state.sessions.notes(&id, query.limit).await?;
    Ok(Json(serde_json::json!({ "notes": notes })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickNoteBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub agent_id: Option<String>,
}

/// Quick note: no session id needed; an implicit per-agent session is
/// created or reused.
pub async fn quick_note(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<QuickNoteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }
    let agent_id = body.agent_id.or_else(|| caller_agent(&headers));
    let note = state
        .sessions
        .quick_note(agent_id, &body.content, body.kind)
        .await?;
    Ok(Json(serde_json::json!({ "note": note })))
}

pub async fn recent_notes(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NotesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let notes = state.sessions.recent_notes(query.limit).await?;
    Ok(Json(serde_json::json!({ "notes": notes })))
}

// ---------------------------------------------------------------------------
// File claims
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FilesBody {
    pub paths: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn claim_files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<FilesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.paths.is_empty() {
        return Err(ApiError::BadRequest("paths is required".into()));
    }
    let files = state
        .sessions
        .claim_files(&id, body.paths, body.force)
        .await?;
    Ok(Json(serde_json::json!({ "files": files })))
}

pub async fn release_files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<FilesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state.sessions.release_files(&id, body.paths).await?;
    Ok(Json(serde_json::json!({ "files": files })))
}

pub async fn files(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state.sessions.files(&id).await?;
    Ok(Json(serde_json::json!({ "files": files })))
}
