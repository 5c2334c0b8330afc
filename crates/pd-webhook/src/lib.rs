//! Outbound webhooks: subscription management with SSRF-hardened URL
//! validation, and the persistent delivery pipeline with retries and
//! HMAC-SHA256 signing.

pub mod delivery;
pub mod validate;

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use pd_core::clock::Clock;
use pd_core::identity::Pattern;
use pd_core::store::{json_column, json_param, Store, StoreError};
use pd_core::types::{WebhookDelivery, WebhookSubscription};

pub use delivery::DeliveryPipeline;
pub use validate::validate_webhook_url;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),

    #[error("webhook url targets a blocked address: {0}")]
    BlockedUrl(String),

    #[error("invalid filter pattern: {0}")]
    InvalidFilter(String),

    #[error("webhook not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookRequest {
    pub url: String,
    /// Event names; empty means all (`*`).
    #[serde(default)]
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub filter: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub secret: Option<String>,
    pub filter: Option<String>,
    pub active: Option<bool>,
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Subscription management
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookManager {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl WebhookManager {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create(
        &self,
        req: CreateWebhookRequest,
    ) -> Result<WebhookSubscription, WebhookError> {
        validate_webhook_url(&req.url).await?;
        if let Some(filter) = &req.filter {
            Pattern::parse(filter).map_err(|e| WebhookError::InvalidFilter(e.to_string()))?;
        }
        let events = if req.events.is_empty() {
            vec!["*".to_string()]
        } else {
            req.events.clone()
        };
        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();
        let sub = WebhookSubscription {
            id: id.clone(),
            url: req.url,
            events,
            secret: req.secret,
            filter: req.filter,
            active: true,
            created_at: now,
            metadata: req.metadata,
        };
        let row = sub.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhooks (id, url, events, secret, filter, active,
                        created_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                    rusqlite::params![
                        row.id,
                        row.url,
                        serde_json::to_string(&row.events).unwrap_or_else(|_| "[\"*\"]".into()),
                        row.secret,
                        row.filter,
                        row.created_at,
                        json_param(&row.metadata),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(sub)
    }

    pub async fn update(
        &self,
        id: &str,
        req: UpdateWebhookRequest,
    ) -> Result<WebhookSubscription, WebhookError> {
        let mut sub = self
            .get(id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;
        if let Some(url) = req.url {
            validate_webhook_url(&url).await?;
            sub.url = url;
        }
        if let Some(filter) = &req.filter {
            Pattern::parse(filter).map_err(|e| WebhookError::InvalidFilter(e.to_string()))?;
            sub.filter = Some(filter.clone());
        }
        if let Some(events) = req.events {
            sub.events = if events.is_empty() {
                vec!["*".to_string()]
            } else {
                events
            };
        }
        if let Some(secret) = req.secret {
            sub.secret = Some(secret);
        }
        if let Some(active) = req.active {
            sub.active = active;
        }
        if let Some(metadata) = req.metadata {
            sub.metadata = Some(metadata);
        }
        let row = sub.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE webhooks SET url = ?2, events = ?3, secret = ?4, filter = ?5,
                        active = ?6, metadata = ?7
                     WHERE id = ?1",
                    rusqlite::params![
                        row.id,
                        row.url,
                        serde_json::to_string(&row.events).unwrap_or_else(|_| "[\"*\"]".into()),
                        row.secret,
                        row.filter,
                        row.active as i64,
                        json_param(&row.metadata),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(sub)
    }

    pub async fn delete(&self, id: &str) -> Result<(), WebhookError> {
        let id_owned = id.to_string();
        let removed = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM webhooks WHERE id = ?1", [&id_owned])?;
                tx.execute(
                    "DELETE FROM webhook_deliveries WHERE subscription_id = ?1",
                    [&id_owned],
                )?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        if removed == 0 {
            return Err(WebhookError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<WebhookSubscription>, WebhookError> {
        let id = id.to_string();
        let sub = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_SUBSCRIPTION} WHERE id = ?1"))?;
                let mut rows = stmt.query([id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_subscription(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(sub)
    }

    pub async fn list(&self) -> Result<Vec<WebhookSubscription>, WebhookError> {
        self.store
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_SUBSCRIPTION} ORDER BY created_at"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_subscription(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(WebhookError::from)
    }

    /// Recorded deliveries for a subscription, newest first.
    pub async fn deliveries(
        &self,
        id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        if self.get(id).await?.is_none() {
            return Err(WebhookError::NotFound(id.to_string()));
        }
        let id = id.to_string();
        let limit = limit.unwrap_or(50).clamp(1, 500);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_DELIVERY} WHERE subscription_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_delivery(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(WebhookError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SELECT_SUBSCRIPTION: &str =
    "SELECT id, url, events, secret, filter, active, created_at, metadata FROM webhooks";

pub(crate) fn row_to_subscription(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<WebhookSubscription> {
    let events_raw: String = row.get(2)?;
    Ok(WebhookSubscription {
        id: row.get(0)?,
        url: row.get(1)?,
        events: serde_json::from_str(&events_raw).unwrap_or_else(|_| vec!["*".to_string()]),
        secret: row.get(3)?,
        filter: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        metadata: json_column(row, 7)?,
    })
}

pub(crate) const SELECT_DELIVERY: &str =
    "SELECT id, subscription_id, event, payload, timestamp, status_code, success,
     attempts, next_retry_at, last_error FROM webhook_deliveries";

pub(crate) fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let payload_raw: String = row.get(3)?;
    Ok(WebhookDelivery {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        event: row.get(2)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        timestamp: row.get(4)?,
        status_code: row.get(5)?,
        success: row.get::<_, i64>(6)? != 0,
        attempts: row.get(7)?,
        next_retry_at: row.get(8)?,
        last_error: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::clock::ManualClock;

    async fn manager() -> WebhookManager {
        let store = Store::open_in_memory().await.unwrap();
        WebhookManager::new(store, Arc::new(ManualClock::at(1_000)))
    }

    #[tokio::test]
    async fn create_defaults_to_all_events() {
        let hooks = manager().await;
        let sub = hooks
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/x".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sub.events, vec!["*"]);
        assert!(sub.active);

        let listed = hooks.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sub.id);
    }

    #[tokio::test]
    async fn ssrf_targets_are_rejected_at_create() {
        let hooks = manager().await;
        let err = hooks
            .create(CreateWebhookRequest {
                url: "http://10.0.0.5/hook".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::BlockedUrl(_)));
    }

    #[tokio::test]
    async fn update_and_delete() {
        let hooks = manager().await;
        let sub = hooks
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/x".into(),
                events: vec!["service.claim".into()],
                filter: Some("myapp:*".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let updated = hooks
            .update(
                &sub.id,
                UpdateWebhookRequest {
                    active: Some(false),
                    events: Some(vec!["lock.acquire".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.active);
        assert_eq!(updated.events, vec!["lock.acquire"]);

        hooks.delete(&sub.id).await.unwrap();
        assert!(matches!(
            hooks.delete(&sub.id).await,
            Err(WebhookError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bad_filter_is_rejected() {
        let hooks = manager().await;
        let err = hooks
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/x".into(),
                filter: Some("bad pattern!".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidFilter(_)));
    }
}
