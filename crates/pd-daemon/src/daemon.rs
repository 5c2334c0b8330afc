//! Composition root: opens the store, wires every component through
//! explicit constructors, spawns the background tasks, and serves the API
//! on both listeners until signaled.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use pd_api::{ApiState, ReaperStats};
use pd_bus::{DaemonEvent, EventBus, ShutdownSignal};
use pd_core::clock::{Clock, SystemClock};
use pd_core::config::Config;
use pd_core::store::Store;
use pd_core::types::ActivityKind;
use pd_probe::OsProbe;

use crate::code_hash;
use crate::reaper::Reaper;

pub struct Daemon {
    config: Config,
    state: Arc<ApiState>,
    reaper: Arc<Reaper>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the store, run migrations, and build the component graph.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::open(config.database_path())
            .await
            .context("failed to open database")?;
        Ok(Self::with_store(config, store))
    }

    /// Build over an already-open store (tests use an in-memory one).
    pub fn with_store(config: Config, store: Store) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let probe = Arc::new(OsProbe::new());
        let bus = EventBus::new();
        let shutdown = ShutdownSignal::new();
        let reaper_stats = Arc::new(ReaperStats::default());

        // The reaper and the API state share component instances; both are
        // thin clones over the same store and bus.
        let activity = pd_core::activity::ActivityLog::new(store.clone(), clock.clone());
        let services = pd_registry::ServicesRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            bus.clone(),
            activity.clone(),
            config.ports.clone(),
            config.limits.metadata_max_bytes,
        );
        let locks = pd_registry::LockManager::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            activity.clone(),
            config.limits.max_lock_ttl_ms,
        );
        let messages = pd_bus::MessageLog::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            config.cleanup.message_channel_cap,
            config.limits.message_read_max,
            config.limits.payload_max_bytes,
        );
        let agents = pd_agents::AgentRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            bus.clone(),
            activity.clone(),
            config.agents.clone(),
        );
        let sessions = pd_agents::SessionManager::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            activity.clone(),
            config.agents.single_active_session,
        );
        let deliveries = pd_webhook::DeliveryPipeline::new(
            store.clone(),
            clock.clone(),
            activity.clone(),
            config.webhooks.clone(),
        );

        let reaper = Reaper::new(
            clock.clone(),
            probe.clone(),
            services,
            locks,
            messages,
            agents,
            sessions,
            activity,
            deliveries,
            config.cleanup.clone(),
            reaper_stats.clone(),
        );

        let state = ApiState::build(
            config.clone(),
            store,
            clock,
            probe,
            bus,
            reaper.clone(),
            reaper_stats,
            code_hash::compute(),
        );

        Self {
            config,
            state,
            reaper,
            shutdown,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve until the shutdown signal fires, then drain and close.
    ///
    /// `tcp_listener` is `None` when TCP is disabled; the Unix socket is
    /// always served.
    pub async fn run(
        self,
        unix_listener: tokio::net::UnixListener,
        tcp_listener: Option<tokio::net::TcpListener>,
    ) -> Result<()> {
        // Background tasks first, so boot-time requeues have workers.
        self.reaper.spawn(self.shutdown.clone());
        self.state
            .deliveries
            .spawn(&self.state.bus, self.shutdown.clone());

        // Startup record and event, then re-queue deliveries that were
        // pending when the previous daemon stopped.
        let now = self.state.clock.now_ms();
        self.state
            .activity
            .record(ActivityKind::DaemonStart, None, None, None, None)
            .await
            .ok();
        self.state.bus.publish(DaemonEvent::new(
            "daemon.start",
            None,
            now,
            serde_json::json!({"pid": std::process::id()}),
        ));
        match self.state.deliveries.requeue_pending().await {
            Ok(n) if n > 0 => info!(count = n, "re-queued pending webhook deliveries"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to re-queue pending deliveries"),
        }

        let router = pd_api::api_router(self.state.clone());

        let mut unix_stop = self.shutdown.subscribe();
        let unix_task = tokio::spawn(
            axum::serve(unix_listener, router.clone())
                .with_graceful_shutdown(async move {
                    let _ = unix_stop.recv().await;
                })
                .into_future(),
        );

        let tcp_task = tcp_listener.map(|listener| {
            let mut tcp_stop = self.shutdown.subscribe();
            tokio::spawn(
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = tcp_stop.recv().await;
                    })
                    .into_future(),
            )
        });

        // Wait for the shutdown signal.
        let mut stop = self.shutdown.subscribe();
        let _ = stop.recv().await;
        info!("daemon stopping");

        // Stop record and event; webhook delivery is best-effort, shutdown
        // does not wait for slow receivers.
        let now = self.state.clock.now_ms();
        self.state
            .activity
            .record(ActivityKind::DaemonStop, None, None, None, None)
            .await
            .ok();
        self.state.bus.publish(DaemonEvent::new(
            "daemon.stop",
            None,
            now,
            serde_json::json!({"pid": std::process::id()}),
        ));

        let mut drain = self.shutdown.clone();
        drain
            .wait_for_drain(1, std::time::Duration::from_secs(2))
            .await;

        if let Err(e) = unix_task.await {
            warn!(error = %e, "unix listener task ended abnormally");
        }
        if let Some(task) = tcp_task {
            if let Err(e) = task.await {
                warn!(error = %e, "tcp listener task ended abnormally");
            }
        }

        self.state.store.clone().close().await;
        let _ = std::fs::remove_file(&self.config.service.socket_path);
        info!("daemon stopped");
        Ok(())
    }
}
