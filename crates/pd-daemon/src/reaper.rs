//! The periodic cleanup pass enforcing cross-table invariants: dead pid ⇒
//! released port ⇒ released locks ⇒ queued resurrection. Step order is
//! load-bearing: services go before agents so agent cleanup observes ports
//! already released, and the activity trim runs last so earlier steps'
//! events survive until after they fire.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use pd_agents::{AgentRegistry, SessionManager};
use pd_api::{CleanupRunner, ReaperStats};
use pd_bus::{DrainGuard, MessageLog, ShutdownSignal};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::config::CleanupConfig;
use pd_probe::Probe;
use pd_registry::{ReleaseRequest, ServiceFilter, ServicesRegistry};
use pd_webhook::DeliveryPipeline;

/// What one pass changed, reported at `/ports/cleanup` and logged.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperReport {
    pub services_released: usize,
    pub released_ports: Vec<u16>,
    pub messages_trimmed: usize,
    pub agents_cleaned: usize,
    pub locks_expired: usize,
    pub activity_trimmed: usize,
    pub deliveries_trimmed: usize,
    pub deliveries_requeued: usize,
    pub notes_trimmed: usize,
}

pub struct Reaper {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn Probe>,
    services: ServicesRegistry,
    locks: pd_registry::LockManager,
    messages: MessageLog,
    agents: AgentRegistry,
    sessions: SessionManager,
    activity: ActivityLog,
    deliveries: DeliveryPipeline,
    config: CleanupConfig,
    stats: Arc<ReaperStats>,
}

impl Reaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        probe: Arc<dyn Probe>,
        services: ServicesRegistry,
        locks: pd_registry::LockManager,
        messages: MessageLog,
        agents: AgentRegistry,
        sessions: SessionManager,
        activity: ActivityLog,
        deliveries: DeliveryPipeline,
        config: CleanupConfig,
        stats: Arc<ReaperStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            probe,
            services,
            locks,
            messages,
            agents,
            sessions,
            activity,
            deliveries,
            config,
            stats,
        })
    }

    /// One full pass. Each step commits its own transaction(s); a failing
    /// step is logged and the pass continues.
    pub async fn pass(&self) -> ReaperReport {
        debug!("reaper pass starting");
        let mut report = ReaperReport::default();

        // 1. Services: elapsed expiry, then dead pids.
        match self.services.release(ReleaseRequest { expired: true, ..Default::default() }).await {
            Ok(out) => {
                report.services_released += out.released;
                report.released_ports.extend(out.released_ports);
            }
            Err(e) => warn!(error = %e, "reaper: expired-service release failed"),
        }
        match self.services.find(ServiceFilter::default()).await {
            Ok(services) => {
                for service in services {
                    let Some(pid) = service.pid else { continue };
                    if self.probe.pid_alive(pid).await {
                        continue;
                    }
                    match self
                        .services
                        .release(ReleaseRequest {
                            id: Some(service.id.clone()),
                            ..Default::default()
                        })
                        .await
                    {
                        Ok(out) => {
                            report.services_released += out.released;
                            report.released_ports.extend(out.released_ports);
                        }
                        Err(e) => {
                            warn!(error = %e, id = %service.id, "reaper: dead-pid release failed")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "reaper: service scan failed"),
        }

        // 2. Messages: expiry and channel depth.
        match self.messages.trim().await {
            Ok(n) => report.messages_trimmed = n,
            Err(e) => warn!(error = %e, "reaper: message trim failed"),
        }

        // 3. Agents: stale -> dead transitions with full resource release.
        match self
            .agents
            .cleanup_dead(self.config.agent_stale_ms, self.config.agent_dead_ms)
            .await
        {
            Ok(outcomes) => report.agents_cleaned = outcomes.len(),
            Err(e) => warn!(error = %e, "reaper: agent cleanup failed"),
        }
        match self.locks.trim_expired().await {
            Ok(n) => report.locks_expired = n,
            Err(e) => warn!(error = %e, "reaper: lock trim failed"),
        }

        // 4. Webhooks: retention, then requeue elapsed retries.
        match self.deliveries.trim(self.config.delivery_retention_ms).await {
            Ok(n) => report.deliveries_trimmed = n,
            Err(e) => warn!(error = %e, "reaper: delivery trim failed"),
        }
        match self.deliveries.requeue_pending().await {
            Ok(n) => report.deliveries_requeued = n,
            Err(e) => warn!(error = %e, "reaper: delivery requeue failed"),
        }

        // 5. Session notes on terminal sessions.
        match self.sessions.trim_notes(self.config.note_retention_ms).await {
            Ok(n) => report.notes_trimmed = n,
            Err(e) => warn!(error = %e, "reaper: note trim failed"),
        }

        // 6. Activity log last.
        match self
            .activity
            .trim(
                self.config.activity_retention_ms,
                self.config.activity_max_rows,
            )
            .await
        {
            Ok(n) => report.activity_trimmed = n,
            Err(e) => warn!(error = %e, "reaper: activity trim failed"),
        }

        self.stats.record_pass(self.clock.now_ms());
        if report.services_released > 0 || report.agents_cleaned > 0 {
            info!(
                services = report.services_released,
                agents = report.agents_cleaned,
                "reaper pass completed"
            );
        } else {
            debug!("reaper pass completed");
        }
        report
    }

    /// Spawn the interval loop; exits on shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: ShutdownSignal) {
        let reaper = Arc::clone(self);
        let mut stop = shutdown.subscribe();
        let guard = DrainGuard::new(shutdown);
        tokio::spawn(async move {
            let _guard = guard;
            let period = std::time::Duration::from_millis(reaper.config.interval_ms.max(1_000));
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        reaper.pass().await;
                    }
                }
            }
            debug!("reaper stopped");
        });
    }
}

#[async_trait]
impl CleanupRunner for Reaper {
    async fn run_pass(&self) -> Result<serde_json::Value, String> {
        let report = self.pass().await;
        serde_json::to_value(&report).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
