//! `/webhooks` — subscription management, test deliveries, delivery history.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use serde::Deserialize;

use pd_webhook::{CreateWebhookRequest, UpdateWebhookRequest};

use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

pub async fn create(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subscription = state.webhooks.create(req).await?;
    Ok(Json(serde_json::json!({ "webhook": subscription })))
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhooks = state.webhooks.list().await?;
    Ok(Json(serde_json::json!({ "webhooks": webhooks })))
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = state
        .webhooks
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("webhook not found: {id}")))?;
    Ok(Json(serde_json::json!({ "webhook": webhook })))
}

pub async fn update(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = state.webhooks.update(&id, req).await?;
    Ok(Json(serde_json::json!({ "webhook": webhook })))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.webhooks.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}

/// Synthesize a delivery so the operator can verify connectivity.
pub async fn test(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.webhooks.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("webhook not found: {id}")));
    }
    let delivery_id = state.deliveries.dispatch_test(&id).await?;
    Ok(Json(serde_json::json!({ "queued": true, "deliveryId": delivery_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<i64>,
}

pub async fn deliveries(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deliveries = state.webhooks.deliveries(&id, query.limit).await?;
    Ok(Json(serde_json::json!({ "deliveries": deliveries })))
}
