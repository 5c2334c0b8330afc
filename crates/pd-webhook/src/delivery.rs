//! The outbound delivery pipeline. Every matching event becomes one row in
//! `webhook_deliveries`; worker tasks post with a short timeout, record
//! each attempt, and schedule bounded exponential retries that ride the
//! reaper's requeue pass. Pending rows are re-queued at boot.

use std::sync::Arc;
use std::time::Duration;

use ring::hmac;
use tracing::{debug, info, warn};

use pd_bus::{DaemonEvent, EventBus, ShutdownSignal};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::config::WebhookPipelineConfig;
use pd_core::identity::Pattern;
use pd_core::store::{Store, StoreError};
use pd_core::types::ActivityKind;

use crate::{row_to_delivery, row_to_subscription, SELECT_DELIVERY};

/// Delivery jobs queued for the workers (row ids). Bounded: a flooded queue
/// drops new jobs, which the next requeue pass re-discovers from the table.
const QUEUE_CAPACITY: usize = 1024;
const WORKERS: usize = 4;

#[derive(Clone)]
pub struct DeliveryPipeline {
    store: Store,
    clock: Arc<dyn Clock>,
    activity: ActivityLog,
    config: WebhookPipelineConfig,
    client: reqwest::Client,
    tx: flume::Sender<i64>,
    rx: flume::Receiver<i64>,
}

impl DeliveryPipeline {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        activity: ActivityLog,
        config: WebhookPipelineConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        let (tx, rx) = flume::bounded(QUEUE_CAPACITY);
        Self {
            store,
            clock,
            activity,
            config,
            client,
            tx,
            rx,
        }
    }

    /// Spawn the dispatcher (bus subscriber) and the delivery workers. All
    /// tasks exit on shutdown.
    pub fn spawn(&self, bus: &EventBus, shutdown: ShutdownSignal) {
        let mut events = bus.subscribe();
        let dispatcher = self.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Err(e) = dispatcher.dispatch_event(&event).await {
                                warn!(error = %e, event = %event.event, "webhook dispatch failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "webhook dispatcher lagged, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("webhook dispatcher stopped");
        });

        for _ in 0..WORKERS {
            let worker = self.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.recv() => break,
                        id = worker.rx.recv_async() => match id {
                            Ok(id) => worker.attempt(id).await,
                            Err(_) => break,
                        }
                    }
                }
            });
        }
    }

    /// Materialize one delivery row per matching subscription and queue it.
    pub async fn dispatch_event(&self, event: &DaemonEvent) -> Result<usize, StoreError> {
        let subs = self.matching_subscriptions(event).await?;
        if subs.is_empty() {
            return Ok(0);
        }
        let payload = serde_json::json!({
            "event": event.event,
            "target_id": event.target_id,
            "timestamp": event.timestamp,
            "data": event.data,
        })
        .to_string();

        let count = subs.len();
        for sub_id in subs {
            let id = self.insert_delivery(&sub_id, &event.event, &payload).await?;
            self.enqueue(id);
        }
        Ok(count)
    }

    /// Synthesize a test delivery for one subscription.
    pub async fn dispatch_test(&self, subscription_id: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let payload = serde_json::json!({
            "event": "webhook.test",
            "timestamp": now,
            "data": {"test": true},
        })
        .to_string();
        let id = self
            .insert_delivery(subscription_id, "webhook.test", &payload)
            .await?;
        self.enqueue(id);
        Ok(id)
    }

    fn enqueue(&self, delivery_id: i64) {
        if self.tx.try_send(delivery_id).is_err() {
            // Queue full; the row stays pending and the next requeue pass
            // picks it up.
            warn!(delivery_id, "delivery queue full");
        }
    }

    async fn matching_subscriptions(
        &self,
        event: &DaemonEvent,
    ) -> Result<Vec<String>, StoreError> {
        let subs = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, url, events, secret, filter, active, created_at, metadata
                     FROM webhooks WHERE active = 1",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_subscription(row)?);
                }
                Ok(out)
            })
            .await?;

        Ok(subs
            .into_iter()
            .filter(|sub| {
                let event_match = sub
                    .events
                    .iter()
                    .any(|e| e == "*" || e == &event.event);
                if !event_match {
                    return false;
                }
                match (&sub.filter, &event.target_id) {
                    (None, _) => true,
                    (Some(filter), Some(target)) => Pattern::parse(filter)
                        .map(|p| p.matches(target))
                        .unwrap_or(false),
                    (Some(_), None) => false,
                }
            })
            .map(|sub| sub.id)
            .collect())
    }

    async fn insert_delivery(
        &self,
        subscription_id: &str,
        event: &str,
        payload: &str,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let sub = subscription_id.to_string();
        let event = event.to_string();
        let payload = payload.to_string();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhook_deliveries
                        (subscription_id, event, payload, timestamp, next_retry_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    rusqlite::params![sub, event, payload, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Execute one delivery attempt and persist the result.
    async fn attempt(&self, delivery_id: i64) {
        let (delivery, url, secret) = match self.load_delivery(delivery_id).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return, // subscription deleted or deactivated
            Err(e) => {
                warn!(delivery_id, error = %e, "failed to load delivery");
                return;
            }
        };
        if delivery.success || delivery.attempts >= self.config.max_attempts {
            return;
        }

        let body = delivery.payload.to_string();
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        if let Some(secret) = &secret {
            let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
            let tag = hmac::sign(&key, body.as_bytes());
            request = request.header("X-Signature", format!("sha256={}", hex(tag.as_ref())));
        }

        let (status_code, success, error): (Option<i64>, bool, Option<String>) =
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    (
                        Some(status.as_u16() as i64),
                        status.is_success(),
                        (!status.is_success()).then(|| format!("http {status}")),
                    )
                }
                Err(e) => (None, false, Some(e.to_string())),
            };

        let attempts = delivery.attempts + 1;
        let next_retry_at = if success || attempts >= self.config.max_attempts {
            None
        } else {
            Some(self.clock.now_ms() + self.backoff_ms(attempts))
        };

        let record = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE webhook_deliveries
                     SET attempts = ?2, status_code = ?3, success = ?4,
                         next_retry_at = ?5, last_error = ?6
                     WHERE id = ?1",
                    rusqlite::params![
                        delivery_id,
                        attempts,
                        status_code,
                        success as i64,
                        next_retry_at,
                        error,
                    ],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = record {
            warn!(delivery_id, error = %e, "failed to record delivery attempt");
            return;
        }

        let _ = self
            .activity
            .record(
                ActivityKind::WebhookDelivery,
                None,
                Some(delivery.subscription_id.clone()),
                Some(format!(
                    "{} -> {} ({})",
                    delivery.event,
                    url,
                    status_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "transport error".into())
                )),
                None,
            )
            .await;

        if success {
            info!(delivery_id, event = %delivery.event, "webhook delivered");
        } else {
            warn!(
                delivery_id,
                event = %delivery.event,
                attempts,
                retry = next_retry_at.is_some(),
                "webhook delivery failed"
            );
        }
    }

    /// Exponential backoff, bounded by the configured ceiling.
    fn backoff_ms(&self, attempts: i64) -> i64 {
        let shift = (attempts - 1).clamp(0, 20) as u32;
        (self.config.backoff_base_ms.saturating_mul(1 << shift)).min(self.config.backoff_max_ms)
    }

    async fn load_delivery(
        &self,
        delivery_id: i64,
    ) -> Result<Option<(pd_core::types::WebhookDelivery, String, Option<String>)>, StoreError>
    {
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_DELIVERY} WHERE id = ?1"))?;
                let mut rows = stmt.query([delivery_id])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let delivery = row_to_delivery(row)?;
                let sub: Option<(String, Option<String>, i64)> = {
                    let mut stmt = conn.prepare(
                        "SELECT url, secret, active FROM webhooks WHERE id = ?1",
                    )?;
                    let mut rows = stmt.query([&delivery.subscription_id])?;
                    match rows.next()? {
                        Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
                        None => None,
                    }
                };
                match sub {
                    Some((url, secret, active)) if active != 0 => {
                        Ok(Some((delivery, url, secret)))
                    }
                    _ => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Requeue and retention
    // -----------------------------------------------------------------------

    /// Queue every pending delivery whose retry time has elapsed. Called at
    /// boot and by each reaper pass.
    pub async fn requeue_pending(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let max_attempts = self.config.max_attempts;
        let ids: Vec<i64> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM webhook_deliveries
                     WHERE success = 0 AND attempts < ?1
                       AND next_retry_at IS NOT NULL AND next_retry_at <= ?2
                     ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![max_attempts, now])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await?;
        let count = ids.len();
        for id in ids {
            self.enqueue(id);
        }
        if count > 0 {
            debug!(count, "pending webhook deliveries requeued");
        }
        Ok(count)
    }

    /// Reaper hook: drop delivery rows older than the retention window.
    pub async fn trim(&self, retention_ms: i64) -> Result<usize, StoreError> {
        let cutoff = self.clock.now_ms() - retention_ms;
        self.store
            .call(move |conn| {
                conn.execute("DELETE FROM webhook_deliveries WHERE timestamp < ?1", [cutoff])
            })
            .await
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.rx.len()
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CreateWebhookRequest, WebhookManager};
    use pd_core::clock::ManualClock;

    async fn pipeline() -> (DeliveryPipeline, WebhookManager, Arc<ManualClock>, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let activity = ActivityLog::new(store.clone(), clock.clone());
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            clock.clone(),
            activity,
            WebhookPipelineConfig::default(),
        );
        let manager = WebhookManager::new(store.clone(), clock.clone());
        (pipeline, manager, clock, store)
    }

    fn event(name: &str, target: Option<&str>) -> DaemonEvent {
        DaemonEvent::new(name, target.map(String::from), 1_000, serde_json::json!({}))
    }

    #[tokio::test]
    async fn dispatch_matches_event_sets_and_filters() {
        let (pipeline, manager, _, _) = pipeline().await;
        manager
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/all".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        manager
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/claims".into(),
                events: vec!["service.claim".into()],
                filter: Some("myapp:*".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Wildcard sub only.
        let n = pipeline
            .dispatch_event(&event("lock.acquire", Some("build")))
            .await
            .unwrap();
        assert_eq!(n, 1);

        // Both subs: event and filter match.
        let n = pipeline
            .dispatch_event(&event("service.claim", Some("myapp:api")))
            .await
            .unwrap();
        assert_eq!(n, 2);

        // Filter mismatch drops the narrow sub.
        let n = pipeline
            .dispatch_event(&event("service.claim", Some("other:api")))
            .await
            .unwrap();
        assert_eq!(n, 1);

        // Filtered sub never matches a target-less event.
        let n = pipeline
            .dispatch_event(&event("service.claim", None))
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn delivery_rows_carry_wire_payload() {
        let (pipeline, manager, _, store) = pipeline().await;
        let sub = manager
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/x".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        pipeline
            .dispatch_event(&event("service.claim", Some("svc")))
            .await
            .unwrap();

        let deliveries = manager.deliveries(&sub.id, None).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let payload = &deliveries[0].payload;
        assert_eq!(payload["event"], "service.claim");
        assert_eq!(payload["target_id"], "svc");
        assert_eq!(payload["timestamp"], 1_000);
        assert!(!deliveries[0].success);
        assert_eq!(deliveries[0].attempts, 0);

        let pending: i64 = store
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM webhook_deliveries WHERE success = 0",
                    [],
                    |r| r.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn requeue_picks_up_elapsed_retries_only() {
        let (pipeline, manager, clock, store) = pipeline().await;
        manager
            .create(CreateWebhookRequest {
                url: "http://hooks.example.com/x".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        pipeline
            .dispatch_event(&event("service.claim", Some("svc")))
            .await
            .unwrap();
        // Drain the freshly-enqueued job so requeue counts are clean.
        while pipeline.rx.try_recv().is_ok() {}

        // Simulate a failed attempt scheduled for the future.
        store
            .call(|conn| {
                conn.execute(
                    "UPDATE webhook_deliveries SET attempts = 1, next_retry_at = 5000",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(pipeline.requeue_pending().await.unwrap(), 0);
        clock.set(6_000);
        assert_eq!(pipeline.requeue_pending().await.unwrap(), 1);
        assert_eq!(pipeline.queue_depth(), 1);
    }

    #[tokio::test]
    async fn delivery_succeeds_against_local_receiver_and_is_signed() {
        use axum::routing::post;

        // Capture received headers/body through shared state.
        let received: Arc<tokio::sync::Mutex<Option<(Option<String>, String)>>> =
            Arc::new(tokio::sync::Mutex::new(None));
        let received_in = received.clone();
        let app = axum::Router::new().route(
            "/hook",
            post(move |headers: axum::http::HeaderMap, body: String| {
                let received = received_in.clone();
                async move {
                    let sig = headers
                        .get("X-Signature")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    *received.lock().await = Some((sig, body));
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (pipeline, _, clock, store) = pipeline().await;
        // Loopback is a blocked webhook target by design, so seed the
        // subscription row directly to exercise the delivery path.
        let now = clock.now_ms();
        store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhooks (id, url, events, secret, created_at)
                     VALUES ('w1', ?1, '[\"*\"]', 'shh', ?2)",
                    rusqlite::params![format!("http://127.0.0.1:{port}/hook"), now],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let delivery_id = pipeline
            .insert_delivery("w1", "service.claim", r#"{"event":"service.claim"}"#)
            .await
            .unwrap();
        pipeline.attempt(delivery_id).await;

        let captured = received.lock().await.clone().expect("receiver hit");
        let sig = captured.0.expect("signature header");
        assert!(sig.starts_with("sha256="));
        // Verify by recomputing over the exact body.
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"shh");
        let tag = hmac::sign(&key, captured.1.as_bytes());
        assert_eq!(sig, format!("sha256={}", hex(tag.as_ref())));

        let (success, attempts, status): (i64, i64, i64) = store
            .call(move |conn| {
                conn.query_row(
                    "SELECT success, attempts, status_code FROM webhook_deliveries WHERE id = ?1",
                    [delivery_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!((success, attempts, status), (1, 1, 200));
    }

    #[tokio::test]
    async fn failed_delivery_schedules_backoff_then_exhausts() {
        let (pipeline, _, clock, store) = pipeline().await;
        let now = clock.now_ms();
        // Nothing listens on this port; transport errors exercise the retry path.
        store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhooks (id, url, events, created_at)
                     VALUES ('w1', 'http://127.0.0.1:1/hook', '[\"*\"]', ?1)",
                    [now],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let delivery_id = pipeline
            .insert_delivery("w1", "service.claim", "{}")
            .await
            .unwrap();

        pipeline.attempt(delivery_id).await;
        let (attempts, next_retry, success): (i64, Option<i64>, i64) = store
            .call(move |conn| {
                conn.query_row(
                    "SELECT attempts, next_retry_at, success
                     FROM webhook_deliveries WHERE id = ?1",
                    [delivery_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(success, 0);
        // First retry lands one base-backoff after the attempt.
        assert_eq!(next_retry, Some(clock.now_ms() + 1_000));

        // Burn through the remaining attempts.
        for _ in 1..5 {
            pipeline.attempt(delivery_id).await;
        }
        let (attempts, next_retry): (i64, Option<i64>) = store
            .call(move |conn| {
                conn.query_row(
                    "SELECT attempts, next_retry_at FROM webhook_deliveries WHERE id = ?1",
                    [delivery_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(attempts, 5);
        assert!(next_retry.is_none(), "exhausted deliveries stop retrying");

        // A further attempt is a no-op.
        pipeline.attempt(delivery_id).await;
        let attempts: i64 = store
            .call(move |conn| {
                conn.query_row(
                    "SELECT attempts FROM webhook_deliveries WHERE id = ?1",
                    [delivery_id],
                    |r| r.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(attempts, 5);
    }

    #[tokio::test]
    async fn backoff_is_exponential_and_capped() {
        let (pipeline, _, _, _) = pipeline().await;
        assert_eq!(pipeline.backoff_ms(1), 1_000);
        assert_eq!(pipeline.backoff_ms(2), 2_000);
        assert_eq!(pipeline.backoff_ms(3), 4_000);
        assert_eq!(pipeline.backoff_ms(20), 300_000); // capped
    }
}
