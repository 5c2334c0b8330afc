//! Shared application state threaded through every handler. Built once by
//! the lifecycle layer from explicit constructors; no globals.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use pd_agents::{AgentRegistry, Inbox, ResurrectionQueue, SessionManager};
use pd_bus::{ConnectionTracker, EventBus, MessageLog};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::config::Config;
use pd_core::store::Store;
use pd_probe::Probe;
use pd_registry::{LockManager, ServicesRegistry};
use pd_webhook::{DeliveryPipeline, WebhookManager};

use crate::rate_limit::RateLimiter;

/// Narrow seam letting the HTTP surface force a cleanup pass without
/// depending on the reaper's crate.
#[async_trait]
pub trait CleanupRunner: Send + Sync + 'static {
    /// Run one pass and return a JSON report.
    async fn run_pass(&self) -> Result<serde_json::Value, String>;
}

/// Reaper progress counters surfaced at `/metrics`.
#[derive(Debug, Default)]
pub struct ReaperStats {
    passes: AtomicU64,
    last_pass_ms: AtomicI64,
}

impl ReaperStats {
    pub fn record_pass(&self, now_ms: i64) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.last_pass_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn last_pass_ms(&self) -> Option<i64> {
        match self.last_pass_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

/// Everything the handlers need, built by the daemon at boot.
pub struct ApiState {
    pub config: Config,
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub probe: Arc<dyn Probe>,
    pub bus: EventBus,
    pub services: ServicesRegistry,
    pub locks: LockManager,
    pub messages: MessageLog,
    pub agents: AgentRegistry,
    pub resurrection: ResurrectionQueue,
    pub inbox: Inbox,
    pub sessions: SessionManager,
    pub webhooks: WebhookManager,
    pub deliveries: DeliveryPipeline,
    pub activity: ActivityLog,
    pub connections: Arc<ConnectionTracker>,
    pub rate_limiter: RateLimiter,
    pub cleanup: Arc<dyn CleanupRunner>,
    pub reaper_stats: Arc<ReaperStats>,
    pub started_at: Instant,
    pub code_hash: String,
}

impl ApiState {
    /// Wire up the full component graph over one store. The caller supplies
    /// the seams (clock, probe, cleanup runner) so tests can substitute.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: Config,
        store: Store,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn Probe>,
        bus: EventBus,
        cleanup: Arc<dyn CleanupRunner>,
        reaper_stats: Arc<ReaperStats>,
        code_hash: String,
    ) -> Arc<Self> {
        let activity = ActivityLog::new(store.clone(), clock.clone());
        let services = ServicesRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            bus.clone(),
            activity.clone(),
            config.ports.clone(),
            config.limits.metadata_max_bytes,
        );
        let locks = LockManager::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            activity.clone(),
            config.limits.max_lock_ttl_ms,
        );
        let messages = MessageLog::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            config.cleanup.message_channel_cap,
            config.limits.message_read_max,
            config.limits.payload_max_bytes,
        );
        let agents = AgentRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            bus.clone(),
            activity.clone(),
            config.agents.clone(),
        );
        let resurrection = ResurrectionQueue::new(store.clone(), clock.clone());
        let inbox = Inbox::new(store.clone(), clock.clone());
        let sessions = SessionManager::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            activity.clone(),
            config.agents.single_active_session,
        );
        let webhooks = WebhookManager::new(store.clone(), clock.clone());
        let deliveries = DeliveryPipeline::new(
            store.clone(),
            clock.clone(),
            activity.clone(),
            config.webhooks.clone(),
        );
        let connections = ConnectionTracker::new(
            config.limits.long_poll_max,
            config.limits.stream_max,
            config.limits.per_origin_max,
        );
        let rate_limiter = RateLimiter::per_minute(config.security.rate_limit_per_minute);

        Arc::new(Self {
            config,
            store,
            clock,
            probe,
            bus,
            services,
            locks,
            messages,
            agents,
            resurrection,
            inbox,
            sessions,
            webhooks,
            deliveries,
            activity,
            connections,
            rate_limiter,
            cleanup,
            reaper_stats,
            started_at: Instant::now(),
            code_hash,
        })
    }
}

/// A cleanup runner that does nothing, for tests and tooling that build an
/// `ApiState` without the daemon's reaper.
pub struct NoopCleanup;

#[async_trait]
impl CleanupRunner for NoopCleanup {
    async fn run_pass(&self) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"skipped": true}))
    }
}
