//! `/activity` — audit-log queries.

use std::sync::Arc;

use axum::extract::{Query, State};
use serde::Deserialize;

use pd_core::activity::ActivityQuery;
use pd_core::identity::Pattern;

use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentQuery {
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub agent: Option<String>,
    /// Identity pattern matched against `target_id`.
    pub target: Option<String>,
}

pub async fn recent(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target_like = match &query.target {
        None => None,
        Some(pattern) => Some(
            Pattern::parse(pattern)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?
                .to_like(),
        ),
    };
    let entries = state
        .activity
        .recent(ActivityQuery {
            limit: query.limit,
            kind: query.kind,
            agent_id: query.agent,
            target_like,
        })
        .await?;
    Ok(Json(serde_json::json!({ "activity": entries })))
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryQuery {
    #[serde(default)]
    pub since: i64,
}

pub async fn summary(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.activity.summary(query.since).await?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}

pub async fn stats(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.activity.stats().await?;
    Ok(Json(serde_json::to_value(&stats).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: i64,
    pub to: i64,
}

pub async fn range(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.from > query.to {
        return Err(ApiError::BadRequest("from must be <= to".into()));
    }
    let entries = state.activity.range(query.from, query.to).await?;
    Ok(Json(serde_json::json!({ "activity": entries })))
}
