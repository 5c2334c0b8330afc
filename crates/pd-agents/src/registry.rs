//! The agent registry. Registration is an idempotent upsert; heartbeats
//! refresh `last_heartbeat`; the reaper drives stale → dead transitions,
//! releasing everything a dead agent owned inside one transaction and
//! leaving a resurrection-queue entry behind.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pd_bus::{DaemonEvent, EventBus};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::config::AgentsConfig;
use pd_core::identity::{self, IdentityError};
use pd_core::store::{Store, StoreError};
use pd_core::types::{ActivityKind, Agent, AgentStatus, ResurrectionState};
use pd_probe::Probe;
use pd_registry::locks::release_locks_by_owner_tx;
use pd_registry::services::release_services_by_owner_tx;

use crate::sessions::{abandon_active_sessions_tx, recent_notes_for_agent_tx};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid agent id: {0}")]
    BadId(#[from] IdentityError),

    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent {id} has a pending resurrection entry; claim it or re-register")]
    ResurrectionPending { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub pid: Option<i64>,
    pub max_services: Option<i64>,
    pub max_locks: Option<i64>,
    #[serde(default)]
    pub identity: RegisterIdentity,
    pub purpose: Option<String>,
    pub worktree_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterIdentity {
    pub project: Option<String>,
    pub stack: Option<String>,
    pub context: Option<String>,
}

/// Registration response: the upserted row, plus a hint when dead agents of
/// the same project left salvageable context behind. The hint never blocks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOutcome {
    pub agent: Agent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salvage_hint: Option<SalvageHint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalvageHint {
    pub pending: Vec<String>,
    pub hint: String,
}

/// What a dead-agent cleanup transaction released.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub agent_id: String,
    pub released_services: Vec<String>,
    pub released_ports: Vec<u16>,
    pub released_locks: Vec<String>,
    pub abandoned_sessions: Vec<String>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    store: Store,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn Probe>,
    bus: EventBus,
    activity: ActivityLog,
    config: AgentsConfig,
}

impl AgentRegistry {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn Probe>,
        bus: EventBus,
        activity: ActivityLog,
        config: AgentsConfig,
    ) -> Self {
        Self {
            store,
            clock,
            probe,
            bus,
            activity,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Register / heartbeat / unregister
    // -----------------------------------------------------------------------

    /// Idempotent upsert on the agent id.
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterOutcome, AgentError> {
        identity::validate_name(&req.id)?;
        let now = self.clock.now_ms();
        let max_services = req.max_services.unwrap_or(self.config.default_max_services);
        let max_locks = req.max_locks.unwrap_or(self.config.default_max_locks);

        let row = req.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, type, pid, registered_at, last_heartbeat,
                        max_services, max_locks, identity_project, identity_stack,
                        identity_context, purpose, worktree_id, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'active')
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name, type = excluded.type, pid = excluded.pid,
                        last_heartbeat = excluded.last_heartbeat,
                        max_services = excluded.max_services, max_locks = excluded.max_locks,
                        identity_project = excluded.identity_project,
                        identity_stack = excluded.identity_stack,
                        identity_context = excluded.identity_context,
                        purpose = excluded.purpose, worktree_id = excluded.worktree_id,
                        status = 'active'",
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.kind,
                        row.pid,
                        now,
                        max_services,
                        max_locks,
                        row.identity.project,
                        row.identity.stack,
                        row.identity.context,
                        row.purpose,
                        row.worktree_id,
                    ],
                )?;
                Ok(())
            })
            .await?;

        // Registering completes any resurrection entry claimed for this id.
        let id = req.id.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE resurrection_queue SET state = 'completed'
                     WHERE new_id = ?1 AND state = 'resurrecting'",
                    [id],
                )?;
                Ok(())
            })
            .await?;

        let salvage_hint = self.salvage_hint(&req).await?;
        self.activity
            .record(
                ActivityKind::AgentRegister,
                Some(req.id.clone()),
                Some(req.id.clone()),
                None,
                None,
            )
            .await?;
        self.bus.publish(DaemonEvent::new(
            "agent.register",
            Some(req.id.clone()),
            now,
            serde_json::json!({"pid": req.pid}),
        ));
        let agent = self
            .get(&req.id)
            .await?
            .ok_or_else(|| AgentError::NotFound(req.id.clone()))?;
        info!(id = %req.id, "agent registered");
        Ok(RegisterOutcome {
            agent,
            salvage_hint,
        })
    }

    /// Pending resurrection entries sharing the registrant's project.
    async fn salvage_hint(
        &self,
        req: &RegisterRequest,
    ) -> Result<Option<SalvageHint>, AgentError> {
        let Some(project) = req.identity.project.clone() else {
            return Ok(None);
        };
        let own_id = req.id.clone();
        let pending: Vec<String> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT old_id FROM resurrection_queue
                     WHERE project = ?1 AND state = 'pending' AND old_id != ?2
                     ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![project, own_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await?;
        if pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(SalvageHint {
            hint: format!(
                "{} dead agent(s) in this project left context behind; \
                 claim with the resurrection queue",
                pending.len()
            ),
            pending,
        }))
    }

    /// Refresh `last_heartbeat`. A heartbeat from an unknown id with a
    /// pending resurrection entry either re-registers (when configured) or
    /// is rejected so the client goes through the explicit claim step.
    pub async fn heartbeat(&self, id: &str) -> Result<Agent, AgentError> {
        let now = self.clock.now_ms();
        let id_owned = id.to_string();
        let updated = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE agents SET last_heartbeat = ?2, status = 'active' WHERE id = ?1",
                    rusqlite::params![id_owned, now],
                )
            })
            .await?;

        if updated == 0 {
            let id_owned = id.to_string();
            let pending: bool = self
                .store
                .call(move |conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM resurrection_queue
                         WHERE old_id = ?1 AND state IN ('pending', 'resurrecting')",
                        [id_owned],
                        |r| r.get::<_, i64>(0),
                    )
                    .map(|n| n > 0)
                })
                .await?;
            if pending && self.config.auto_revive_on_heartbeat {
                warn!(id, "auto-reviving agent from heartbeat");
                let outcome = self
                    .register(RegisterRequest {
                        id: id.to_string(),
                        ..Default::default()
                    })
                    .await?;
                let id_owned = id.to_string();
                self.store
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE resurrection_queue SET state = 'completed'
                             WHERE old_id = ?1 AND state IN ('pending', 'resurrecting')",
                            [id_owned],
                        )?;
                        Ok(())
                    })
                    .await?;
                return Ok(outcome.agent);
            }
            if pending {
                return Err(AgentError::ResurrectionPending { id: id.to_string() });
            }
            return Err(AgentError::NotFound(id.to_string()));
        }

        self.activity
            .record(
                ActivityKind::AgentHeartbeat,
                Some(id.to_string()),
                Some(id.to_string()),
                None,
                None,
            )
            .await?;
        self.get(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }

    /// Remove the agent row. Owned services and locks are released the same
    /// way the reaper would release them.
    pub async fn unregister(&self, id: &str) -> Result<CleanupOutcome, AgentError> {
        if self.get(id).await?.is_none() {
            return Err(AgentError::NotFound(id.to_string()));
        }
        let outcome = self.release_owned(id, true, false).await?;
        self.activity
            .record(
                ActivityKind::AgentUnregister,
                Some(id.to_string()),
                Some(id.to_string()),
                None,
                None,
            )
            .await?;
        self.bus.publish(DaemonEvent::new(
            "agent.unregister",
            Some(id.to_string()),
            self.clock.now_ms(),
            serde_json::json!({}),
        ));
        Ok(outcome)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>, AgentError> {
        let id = id.to_string();
        let agent = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_AGENT} WHERE id = ?1"))?;
                let mut rows = stmt.query([id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(agent)
    }

    pub async fn list(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>, AgentError> {
        self.store
            .call(move |conn| {
                let mut sql = format!("{SELECT_AGENT} WHERE 1=1");
                if status.is_some() {
                    sql.push_str(" AND status = ?1");
                }
                sql.push_str(" ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match status {
                    Some(s) => stmt.query([s.as_str()])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(AgentError::from)
    }

    // -----------------------------------------------------------------------
    // Staleness and cleanup
    // -----------------------------------------------------------------------

    /// Reaper hook: mark stale agents, transition dead ones, and release
    /// everything they owned. Returns one outcome per dead agent.
    pub async fn cleanup_dead(
        &self,
        stale_ms: i64,
        dead_ms: i64,
    ) -> Result<Vec<CleanupOutcome>, AgentError> {
        let now = self.clock.now_ms();
        let candidates: Vec<(String, Option<i64>, i64)> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, pid, last_heartbeat FROM agents
                     WHERE status IN ('active', 'stale') AND last_heartbeat < ?1",
                )?;
                let mut rows = stmt.query([now - stale_ms])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?, row.get(2)?));
                }
                Ok(out)
            })
            .await?;

        let mut outcomes = Vec::new();
        for (id, pid, last_heartbeat) in candidates {
            let pid_dead = match pid {
                Some(pid) => !self.probe.pid_alive(pid).await,
                None => false,
            };
            let dead = pid_dead || now - last_heartbeat > dead_ms;
            if dead {
                let outcome = self.release_owned(&id, false, true).await?;
                self.activity
                    .record(
                        ActivityKind::AgentCleanup,
                        Some(id.clone()),
                        Some(id.clone()),
                        Some(format!(
                            "released {} services, {} locks",
                            outcome.released_services.len(),
                            outcome.released_locks.len()
                        )),
                        None,
                    )
                    .await?;
                self.bus.publish(DaemonEvent::new(
                    "agent.cleanup",
                    Some(id.clone()),
                    now,
                    serde_json::to_value(&outcome).unwrap_or_default(),
                ));
                info!(id = %id, "dead agent cleaned up");
                outcomes.push(outcome);
            } else {
                let id_owned = id.clone();
                self.store
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE agents SET status = 'stale' WHERE id = ?1",
                            [id_owned],
                        )?;
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(outcomes)
    }

    /// One transaction: release services and locks owned by `agent_id`,
    /// abandon its active sessions, then either delete the row
    /// (`delete_row`) or mark it dead, optionally enqueueing a resurrection
    /// entry capturing its context.
    async fn release_owned(
        &self,
        agent_id: &str,
        delete_row: bool,
        enqueue_resurrection: bool,
    ) -> Result<CleanupOutcome, AgentError> {
        let now = self.clock.now_ms();
        let id = agent_id.to_string();
        let outcome = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let services = release_services_by_owner_tx(&tx, &id)?;
                let locks = release_locks_by_owner_tx(&tx, &id)?;
                let sessions = abandon_active_sessions_tx(&tx, &id, now)?;

                if enqueue_resurrection {
                    let (purpose, project): (Option<String>, Option<String>) = tx
                        .query_row(
                            "SELECT purpose, identity_project FROM agents WHERE id = ?1",
                            [&id],
                            |r| Ok((r.get(0)?, r.get(1)?)),
                        )
                        .unwrap_or((None, None));
                    let notes = recent_notes_for_agent_tx(&tx, &id, 20)?;
                    let notes_json =
                        serde_json::to_string(&notes).unwrap_or_else(|_| "[]".into());
                    tx.execute(
                        "INSERT INTO resurrection_queue
                            (old_id, project, purpose, session_id, notes, state,
                             created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                         ON CONFLICT(old_id) DO UPDATE SET
                            project = excluded.project, purpose = excluded.purpose,
                            session_id = excluded.session_id, notes = excluded.notes,
                            state = 'pending', new_id = NULL, updated_at = excluded.updated_at",
                        rusqlite::params![
                            id,
                            project,
                            purpose,
                            sessions.first(),
                            notes_json,
                            ResurrectionState::Pending.as_str(),
                            now,
                        ],
                    )?;
                }

                if delete_row {
                    tx.execute("DELETE FROM agents WHERE id = ?1", [&id])?;
                } else {
                    tx.execute("UPDATE agents SET status = 'dead' WHERE id = ?1", [&id])?;
                }
                tx.commit()?;
                Ok(CleanupOutcome {
                    agent_id: id,
                    released_ports: services
                        .iter()
                        .filter_map(|(_, port)| port.map(|p| p as u16))
                        .collect(),
                    released_services: services.into_iter().map(|(id, _)| id).collect(),
                    released_locks: locks,
                    abandoned_sessions: sessions,
                })
            })
            .await?;
        Ok(outcome)
    }
}

const SELECT_AGENT: &str = "SELECT id, name, type, pid, registered_at, last_heartbeat,
    max_services, max_locks, identity_project, identity_stack, identity_context,
    purpose, worktree_id, status FROM agents";

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status: String = row.get(13)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        pid: row.get(3)?,
        registered_at: row.get(4)?,
        last_heartbeat: row.get(5)?,
        max_services: row.get(6)?,
        max_locks: row.get(7)?,
        identity_project: row.get(8)?,
        identity_stack: row.get(9)?,
        identity_context: row.get(10)?,
        purpose: row.get(11)?,
        worktree_id: row.get(12)?,
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Active),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::clock::ManualClock;
    use pd_probe::StaticProbe;

    struct Fixture {
        agents: AgentRegistry,
        clock: Arc<ManualClock>,
        probe: Arc<StaticProbe>,
        store: Store,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let probe = StaticProbe::new();
        let activity = ActivityLog::new(store.clone(), clock.clone());
        let agents = AgentRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            EventBus::new(),
            activity,
            AgentsConfig::default(),
        );
        Fixture {
            agents,
            clock,
            probe,
            store,
        }
    }

    fn register_req(id: &str, pid: i64) -> RegisterRequest {
        RegisterRequest {
            id: id.into(),
            pid: Some(pid),
            identity: RegisterIdentity {
                project: Some("myapp".into()),
                ..Default::default()
            },
            purpose: Some("tests".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_upsert() {
        let f = fixture().await;
        let first = f.agents.register(register_req("a1", 11)).await.unwrap();
        assert_eq!(first.agent.max_services, 10);
        assert!(first.salvage_hint.is_none());

        f.clock.advance(100);
        let second = f.agents.register(register_req("a1", 12)).await.unwrap();
        assert_eq!(second.agent.pid, Some(12));
        assert_eq!(second.agent.registered_at, 1_000);
        assert_eq!(second.agent.last_heartbeat, 1_100);
        assert_eq!(f.agents.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_missing_is_404() {
        let f = fixture().await;
        f.agents.register(register_req("a1", 11)).await.unwrap();
        f.clock.advance(500);
        let agent = f.agents.heartbeat("a1").await.unwrap();
        assert_eq!(agent.last_heartbeat, 1_500);

        assert!(matches!(
            f.agents.heartbeat("ghost").await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn register_heartbeat_unregister_leaves_nothing() {
        let f = fixture().await;
        f.probe.set_alive(11, true);
        f.agents.register(register_req("a1", 11)).await.unwrap();
        f.agents.heartbeat("a1").await.unwrap();
        f.store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO services (id, port, agent_id, status, created_at, last_seen)
                     VALUES ('myapp:api', 3100, 'a1', 'assigned', 1, 1)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO locks (name, owner, acquired_at, expires_at)
                     VALUES ('build', 'a1', 1, 999999)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let outcome = f.agents.unregister("a1").await.unwrap();
        assert_eq!(outcome.released_services, vec!["myapp:api"]);
        assert_eq!(outcome.released_ports, vec![3100]);
        assert_eq!(outcome.released_locks, vec!["build"]);

        assert!(f.agents.get("a1").await.unwrap().is_none());
        let (services, locks): (i64, i64) = f
            .store
            .call(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM services", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM locks", [], |r| r.get(0))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!((services, locks), (0, 0));
    }

    #[tokio::test]
    async fn dead_agent_cleanup_releases_and_enqueues_resurrection() {
        let f = fixture().await;
        f.probe.set_alive(11, true);
        f.agents.register(register_req("a1", 11)).await.unwrap();
        f.store
            .call(|conn| {
                conn.execute_batch(
                    "INSERT INTO services (id, port, agent_id, status, created_at, last_seen)
                         VALUES ('myapp:api', 3100, 'a1', 'assigned', 1, 1);
                     INSERT INTO locks (name, owner, acquired_at, expires_at)
                         VALUES ('build', 'a1', 1, 99999999);
                     INSERT INTO sessions (id, purpose, status, agent_id, created_at, updated_at)
                         VALUES ('s1', 'work', 'active', 'a1', 1, 1);
                     INSERT INTO session_notes (session_id, content, created_at)
                         VALUES ('s1', 'progress so far', 1);",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        // Heartbeat goes stale and the pid dies.
        f.clock.advance(10 * 60 * 1000);
        f.probe.set_alive(11, false);
        let outcomes = f
            .agents
            .cleanup_dead(5 * 60 * 1000, 15 * 60 * 1000)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].released_ports, vec![3100]);
        assert_eq!(outcomes[0].abandoned_sessions, vec!["s1"]);

        let agent = f.agents.get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Dead);

        // After the transaction: no owned services or locks remain.
        let (services, locks): (i64, i64) = f
            .store
            .call(|conn| {
                Ok((
                    conn.query_row(
                        "SELECT COUNT(*) FROM services WHERE agent_id = 'a1'",
                        [],
                        |r| r.get(0),
                    )?,
                    conn.query_row("SELECT COUNT(*) FROM locks WHERE owner = 'a1'", [], |r| {
                        r.get(0)
                    })?,
                ))
            })
            .await
            .unwrap();
        assert_eq!((services, locks), (0, 0));

        // Resurrection entry captured the context.
        let (state, purpose, session_id, notes): (String, Option<String>, Option<String>, String) =
            f.store
                .call(|conn| {
                    conn.query_row(
                        "SELECT state, purpose, session_id, notes
                         FROM resurrection_queue WHERE old_id = 'a1'",
                        [],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                    )
                })
                .await
                .unwrap();
        assert_eq!(state, "pending");
        assert_eq!(purpose.as_deref(), Some("tests"));
        assert_eq!(session_id.as_deref(), Some("s1"));
        assert!(notes.contains("progress so far"));
    }

    #[tokio::test]
    async fn stale_but_alive_agent_is_only_marked_stale() {
        let f = fixture().await;
        f.probe.set_alive(11, true);
        f.agents.register(register_req("a1", 11)).await.unwrap();
        f.clock.advance(6 * 60 * 1000); // stale, not yet dead
        let outcomes = f
            .agents
            .cleanup_dead(5 * 60 * 1000, 15 * 60 * 1000)
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        let agent = f.agents.get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Stale);

        // A heartbeat brings it back to active.
        let agent = f.agents.heartbeat("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn register_surfaces_salvage_hint_for_same_project() {
        let f = fixture().await;
        f.store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO resurrection_queue
                        (old_id, project, state, created_at, updated_at)
                     VALUES ('dead-1', 'myapp', 'pending', 1, 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let outcome = f.agents.register(register_req("a2", 22)).await.unwrap();
        let hint = outcome.salvage_hint.expect("salvage hint");
        assert_eq!(hint.pending, vec!["dead-1"]);
    }

    #[tokio::test]
    async fn heartbeat_with_pending_resurrection_is_a_deliberate_step() {
        let f = fixture().await;
        f.store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO resurrection_queue
                        (old_id, project, state, created_at, updated_at)
                     VALUES ('a1', 'myapp', 'pending', 1, 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            f.agents.heartbeat("a1").await,
            Err(AgentError::ResurrectionPending { .. })
        ));
    }
}
