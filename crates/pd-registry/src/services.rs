//! The services registry: one row per semantic identity, at most one live
//! port per row, reconciled against both the database and the OS listener
//! set. The claim path is the hot path and must resolve port races without
//! ever violating port uniqueness.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pd_bus::{DaemonEvent, EventBus};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::config::PortsConfig;
use pd_core::identity::{Identity, IdentityError, Pattern};
use pd_core::store::{json_column, json_param, Store, StoreError};
use pd_core::types::{ActivityKind, Endpoint, Service, ServiceStatus};
use pd_probe::Probe;

/// Bounded retries for the insert/re-check race protocol.
const CLAIM_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("port {0} is reserved")]
    ReservedPort(u16),

    #[error("port {port} is outside the configured range {start}-{end}")]
    OutOfRangePort { port: u16, start: u16, end: u16 },

    #[error("invalid port range {0}-{1}")]
    BadRange(u16, u16),

    #[error("agent {agent_id} has reached its service quota ({max})")]
    QuotaExceeded { agent_id: String, max: i64 },

    #[error("no free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("port assignment kept colliding, try again")]
    PortRace,

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("invalid env token: {0}")]
    InvalidEnv(String),

    #[error("metadata exceeds {0} bytes")]
    MetadataTooLarge(usize),

    #[error("release needs an id, a pattern, or expired: true")]
    EmptyRelease,

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub id: String,
    /// Try this port first; reserved or out-of-range values are rejected.
    pub port: Option<u16>,
    /// `[start, end]`, defaults to the configured range.
    pub range: Option<(u16, u16)>,
    /// Claim a row without a port (background worker).
    #[serde(default, rename = "noPort")]
    pub no_port: bool,
    pub expires_at: Option<i64>,
    pub paired_with: Option<String>,
    pub health_url: Option<String>,
    pub restart_policy: Option<String>,
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Claimant pid, from the `X-PID` header.
    #[serde(skip)]
    pub pid: Option<i64>,
    /// Caller agent, from the `X-Agent-Id` header.
    #[serde(skip)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub port: Option<u16>,
    /// `true` when an existing live claim was renewed.
    pub existing: bool,
    pub service: Service,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub id: Option<String>,
    pub pattern: Option<String>,
    /// Release every row whose `expires_at` has elapsed.
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub released: usize,
    pub released_ports: Vec<u16>,
}

/// Result of the claim-insert transaction.
enum InsertOutcome {
    Created(Service),
    /// A concurrent claim of the same identity got there first.
    Existing(Service),
}

#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub pattern: Option<String>,
    pub status: Option<ServiceStatus>,
    pub port: Option<u16>,
    /// Only rows whose `expires_at` has elapsed.
    pub expired: bool,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServicesRegistry {
    store: Store,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn Probe>,
    bus: EventBus,
    activity: ActivityLog,
    ports: PortsConfig,
    metadata_max_bytes: usize,
}

impl ServicesRegistry {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn Probe>,
        bus: EventBus,
        activity: ActivityLog,
        ports: PortsConfig,
        metadata_max_bytes: usize,
    ) -> Self {
        Self {
            store,
            clock,
            probe,
            bus,
            activity,
            ports,
            metadata_max_bytes,
        }
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim a port for an identity. Renewing an existing live claim returns
    /// the same port with `existing: true`.
    pub async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome, RegistryError> {
        Identity::parse(&req.id)?;
        if let Some(metadata) = &req.metadata {
            let size = metadata.to_string().len();
            if size > self.metadata_max_bytes {
                return Err(RegistryError::MetadataTooLarge(self.metadata_max_bytes));
            }
        }

        let (start, end) = match req.range {
            Some((s, e)) if s <= e && s > 0 => (s, e),
            Some((s, e)) => return Err(RegistryError::BadRange(s, e)),
            None => (self.ports.range_start, self.ports.range_end),
        };
        let reserved: HashSet<u16> = self.ports.reserved.iter().copied().collect();
        if let Some(port) = req.port {
            if reserved.contains(&port) {
                return Err(RegistryError::ReservedPort(port));
            }
            if port < start || port > end {
                return Err(RegistryError::OutOfRangePort { port, start, end });
            }
        }

        let now = self.clock.now_ms();

        // Renewal path: a live row whose pid is still alive keeps its port.
        let prior = self.get(&req.id).await?;
        if let Some(existing) = &prior {
            let expired = existing.expires_at.is_some_and(|at| at <= now);
            let alive = match existing.pid {
                Some(pid) => self.probe.pid_alive(pid).await,
                // A row without a pid is renewed by any claim of the same id.
                None => true,
            };
            if !expired && alive {
                let service = self.touch(&req.id, req.pid, now).await?;
                debug!(id = %req.id, port = ?service.port, "claim renewed");
                return Ok(ClaimOutcome {
                    port: service.port,
                    existing: true,
                    service,
                });
            }
        }

        self.quota_check(&req).await?;

        // OS view, fetched once per claim; the post-insert re-check probes
        // the single candidate port directly.
        let os_ports: HashSet<u16> = match self.probe.listeners().await {
            Ok(listeners) => listeners.iter().map(|l| l.port).collect(),
            Err(e) => {
                warn!(error = %e, "listener enumeration unavailable, claiming against DB only");
                HashSet::new()
            }
        };

        // Whether the caller observed a stale row it intends to replace; a
        // row found in the insert transaction without this flag set was put
        // there by a concurrent claim of the same identity and is returned
        // as a renewal instead.
        let replace_existing = prior.is_some();

        let mut excluded: HashSet<u16> = HashSet::new();
        for _attempt in 0..CLAIM_RETRIES {
            let candidate = if req.no_port {
                None
            } else {
                Some(self.pick_port(&req, start, end, &reserved, &os_ports, &excluded, now).await?)
            };

            match self.insert_claim(&req, candidate, replace_existing, now).await {
                Ok(InsertOutcome::Existing(service)) => {
                    debug!(id = %req.id, "lost claim race, renewing instead");
                    return Ok(ClaimOutcome {
                        port: service.port,
                        existing: true,
                        service,
                    });
                }
                Ok(InsertOutcome::Created(service)) => {
                    // Reconcile with an out-of-band binder that grabbed the
                    // port between the scan and the insert.
                    if let Some(port) = candidate {
                        if self.probe.port_in_use(port).await {
                            warn!(id = %req.id, port, "port taken out-of-band, retrying");
                            self.delete_row(&req.id).await?;
                            excluded.insert(port);
                            continue;
                        }
                    }
                    self.activity
                        .record(
                            ActivityKind::ServiceClaim,
                            req.agent_id.clone(),
                            Some(req.id.clone()),
                            candidate.map(|p| format!("port {p}")),
                            None,
                        )
                        .await?;
                    self.bus.publish(DaemonEvent::new(
                        "service.claim",
                        Some(req.id.clone()),
                        now,
                        serde_json::json!({"port": candidate, "existing": false}),
                    ));
                    info!(id = %req.id, port = ?candidate, "port claimed");
                    return Ok(ClaimOutcome {
                        port: candidate,
                        existing: false,
                        service,
                    });
                }
                Err(RegistryError::PortRace) => {
                    if let Some(port) = candidate {
                        excluded.insert(port);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::PortRace)
    }

    /// Candidate selection: preferred port when free, otherwise the first
    /// free port scanning the range in order.
    async fn pick_port(
        &self,
        req: &ClaimRequest,
        start: u16,
        end: u16,
        reserved: &HashSet<u16>,
        os_ports: &HashSet<u16>,
        excluded: &HashSet<u16>,
        now: i64,
    ) -> Result<u16, RegistryError> {
        let db_ports: HashSet<u16> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT port FROM services
                     WHERE port IS NOT NULL
                       AND (expires_at IS NULL OR expires_at > ?1)",
                )?;
                let mut rows = stmt.query([now])?;
                let mut out = HashSet::new();
                while let Some(row) = rows.next()? {
                    let port: i64 = row.get(0)?;
                    out.insert(port as u16);
                }
                Ok(out)
            })
            .await?;

        let free = |port: u16| {
            !reserved.contains(&port)
                && !db_ports.contains(&port)
                && !os_ports.contains(&port)
                && !excluded.contains(&port)
        };

        if let Some(port) = req.port {
            if free(port) {
                return Ok(port);
            }
            // Preferred port held by the DB or the OS: fall back to the scan.
        }
        (start..=end)
            .find(|&p| free(p))
            .ok_or(RegistryError::NoFreePort { start, end })
    }

    /// Insert the claim row. A unique-constraint hit on the port column maps
    /// to [`RegistryError::PortRace`] so the caller can retry with a new
    /// candidate; a row for the same identity appearing since the caller's
    /// pre-check means a concurrent claim won and its row is returned.
    async fn insert_claim(
        &self,
        req: &ClaimRequest,
        port: Option<u16>,
        replace_existing: bool,
        now: i64,
    ) -> Result<InsertOutcome, RegistryError> {
        let id = req.id.clone();
        let pid = req.pid;
        let cmd = req.cmd.clone();
        let cwd = req.cwd.clone();
        let expires_at = req.expires_at;
        let restart_policy = req.restart_policy.clone();
        let health_url = req.health_url.clone();
        let paired_with = req.paired_with.clone();
        let agent_id = req.agent_id.clone();
        let metadata = json_param(&req.metadata);

        let result = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let already_present: bool = tx
                    .query_row("SELECT 1 FROM services WHERE id = ?1", [&id], |_| Ok(()))
                    .map(|_| true)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(false),
                        other => Err(other),
                    })?;
                if already_present && !replace_existing {
                    tx.execute(
                        "UPDATE services SET last_seen = ?2 WHERE id = ?1",
                        rusqlite::params![id, now],
                    )?;
                    tx.commit()?;
                    return Ok(true);
                }
                // A stale row for this identity (dead pid or elapsed expiry)
                // is replaced wholesale.
                tx.execute("DELETE FROM services WHERE id = ?1", [&id])?;
                tx.execute(
                    "INSERT INTO services (id, port, pid, cmd, cwd, status, created_at,
                        last_seen, expires_at, restart_policy, health_url, paired_with,
                        agent_id, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'assigned', ?6, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        id,
                        port.map(|p| p as i64),
                        pid,
                        cmd,
                        cwd,
                        now,
                        expires_at,
                        restart_policy,
                        health_url,
                        paired_with,
                        agent_id,
                        metadata,
                    ],
                )?;
                tx.commit()?;
                Ok(false)
            })
            .await;

        match result {
            Ok(renewed) => {
                let service = self
                    .get(&req.id)
                    .await?
                    .ok_or_else(|| RegistryError::NotFound(req.id.clone()))?;
                if renewed {
                    Ok(InsertOutcome::Existing(service))
                } else {
                    Ok(InsertOutcome::Created(service))
                }
            }
            Err(StoreError::Db(e)) if is_unique_violation(&e) => Err(RegistryError::PortRace),
            Err(e) => Err(e.into()),
        }
    }

    async fn quota_check(&self, req: &ClaimRequest) -> Result<(), RegistryError> {
        let Some(agent_id) = req.agent_id.clone() else {
            return Ok(());
        };
        let check = self
            .store
            .call(move |conn| {
                let max: Option<i64> = conn
                    .query_row(
                        "SELECT max_services FROM agents WHERE id = ?1",
                        [&agent_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(max) = max else {
                    return Ok(None);
                };
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM services WHERE agent_id = ?1",
                    [&agent_id],
                    |r| r.get(0),
                )?;
                Ok(Some((count, max)))
            })
            .await?;
        if let Some((count, max)) = check {
            if count >= max {
                return Err(RegistryError::QuotaExceeded {
                    agent_id: req.agent_id.clone().unwrap_or_default(),
                    max,
                });
            }
        }
        Ok(())
    }

    /// Refresh `last_seen` (and the pid when the caller provides one).
    async fn touch(
        &self,
        id: &str,
        pid: Option<i64>,
        now: i64,
    ) -> Result<Service, RegistryError> {
        let id_owned = id.to_string();
        self.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE services SET last_seen = ?2, pid = COALESCE(?3, pid)
                     WHERE id = ?1",
                    rusqlite::params![id_owned, now, pid],
                )
            })
            .await?;
        self.get(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn delete_row(&self, id: &str) -> Result<(), RegistryError> {
        let id = id.to_string();
        self.store
            .call(move |conn| conn.execute("DELETE FROM services WHERE id = ?1", [id]))
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Release by exact id, by pattern, or by `expired: true`. Returns the
    /// released count and port list.
    pub async fn release(&self, req: ReleaseRequest) -> Result<ReleaseOutcome, RegistryError> {
        let now = self.clock.now_ms();
        let (clause, param): (&str, Option<String>) = if let Some(id) = &req.id {
            Identity::parse(id)?;
            ("id = ?1", Some(id.clone()))
        } else if let Some(pattern) = &req.pattern {
            let like = Pattern::parse(pattern)?.to_like();
            ("id LIKE ?1 ESCAPE '\\'", Some(like))
        } else if req.expired {
            ("expires_at IS NOT NULL AND expires_at <= ?1", None)
        } else {
            return Err(RegistryError::EmptyRelease);
        };

        let sql_select = format!(
            "SELECT id, port FROM services WHERE {clause}"
        );
        let sql_delete = format!("DELETE FROM services WHERE {clause}");
        let released: Vec<(String, Option<i64>)> = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let rows = {
                    let mut stmt = tx.prepare(&sql_select)?;
                    let mut rows = match &param {
                        Some(p) => stmt.query(rusqlite::params![p])?,
                        None => stmt.query(rusqlite::params![now])?,
                    };
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?));
                    }
                    out
                };
                match &param {
                    Some(p) => tx.execute(&sql_delete, rusqlite::params![p])?,
                    None => tx.execute(&sql_delete, rusqlite::params![now])?,
                };
                tx.commit()?;
                Ok(rows)
            })
            .await?;

        let released_ports: Vec<u16> = released
            .iter()
            .filter_map(|(_, port)| port.map(|p| p as u16))
            .collect();
        for (id, port) in &released {
            self.activity
                .record(
                    ActivityKind::ServiceRelease,
                    None,
                    Some(id.clone()),
                    port.map(|p| format!("port {p}")),
                    None,
                )
                .await?;
            self.bus.publish(DaemonEvent::new(
                "service.release",
                Some(id.clone()),
                now,
                serde_json::json!({"port": port}),
            ));
        }
        if !released.is_empty() {
            info!(count = released.len(), ports = ?released_ports, "services released");
        }
        Ok(ReleaseOutcome {
            released: released.len(),
            released_ports,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Option<Service>, RegistryError> {
        let id = id.to_string();
        let row = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_SERVICE} WHERE id = ?1"))?;
                let mut rows = stmt.query([id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_service(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn find(&self, filter: ServiceFilter) -> Result<Vec<Service>, RegistryError> {
        let like = match &filter.pattern {
            Some(pattern) => Some(Pattern::parse(pattern)?.to_like()),
            None => None,
        };
        let now = self.clock.now_ms();
        self.store
            .call(move |conn| {
                let mut sql = format!("{SELECT_SERVICE} WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(like) = like {
                    sql.push_str(" AND id LIKE ? ESCAPE '\\'");
                    params.push(Box::new(like));
                }
                if let Some(status) = filter.status {
                    sql.push_str(" AND status = ?");
                    params.push(Box::new(status.as_str().to_string()));
                }
                if let Some(port) = filter.port {
                    sql.push_str(" AND port = ?");
                    params.push(Box::new(port as i64));
                }
                if filter.expired {
                    sql.push_str(" AND expires_at IS NOT NULL AND expires_at <= ?");
                    params.push(Box::new(now));
                }
                sql.push_str(" ORDER BY id ASC");
                let mut stmt = conn.prepare(&sql)?;
                let refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_service(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(RegistryError::from)
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    /// Upsert `(service_id, env) -> url`.
    pub async fn set_endpoint(
        &self,
        id: &str,
        env: &str,
        url: &str,
    ) -> Result<Endpoint, RegistryError> {
        if self.get(id).await?.is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        if env.is_empty()
            || env.len() > 32
            || !env
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
        {
            return Err(RegistryError::InvalidEnv(env.to_string()));
        }
        let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or("");
        if !matches!(scheme, "http" | "https" | "ws" | "wss") {
            return Err(RegistryError::InvalidUrl(url.to_string()));
        }

        let now = self.clock.now_ms();
        let (id_owned, env_owned, url_owned) =
            (id.to_string(), env.to_string(), url.to_string());
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO endpoints (service_id, env, url, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(service_id, env) DO UPDATE SET
                        url = excluded.url, updated_at = excluded.updated_at",
                    rusqlite::params![id_owned, env_owned, url_owned, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(Endpoint {
            service_id: id.to_string(),
            env: env.to_string(),
            url: url.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn endpoints(&self, id: &str) -> Result<Vec<Endpoint>, RegistryError> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT service_id, env, url, created_at, updated_at
                     FROM endpoints WHERE service_id = ?1 ORDER BY env",
                )?;
                let mut rows = stmt.query([id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Endpoint {
                        service_id: row.get(0)?,
                        env: row.get(1)?,
                        url: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(RegistryError::from)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers shared with the agent cleanup path
// ---------------------------------------------------------------------------

/// Delete every service owned by `agent_id` inside an open transaction.
/// Returns `(id, port)` for each released row.
pub fn release_services_by_owner_tx(
    tx: &rusqlite::Transaction<'_>,
    agent_id: &str,
) -> rusqlite::Result<Vec<(String, Option<i64>)>> {
    let rows = {
        let mut stmt = tx.prepare("SELECT id, port FROM services WHERE agent_id = ?1")?;
        let mut rows = stmt.query([agent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?));
        }
        out
    };
    tx.execute("DELETE FROM services WHERE agent_id = ?1", [agent_id])?;
    Ok(rows)
}

const SELECT_SERVICE: &str = "SELECT id, port, pid, cmd, cwd, status, created_at, last_seen,
    expires_at, restart_policy, health_url, tunnel_provider, tunnel_url, paired_with,
    agent_id, metadata FROM services";

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
    let status: String = row.get(5)?;
    let port: Option<i64> = row.get(1)?;
    Ok(Service {
        id: row.get(0)?,
        port: port.map(|p| p as u16),
        pid: row.get(2)?,
        cmd: row.get(3)?,
        cwd: row.get(4)?,
        status: ServiceStatus::parse(&status).unwrap_or(ServiceStatus::Assigned),
        created_at: row.get(6)?,
        last_seen: row.get(7)?,
        expires_at: row.get(8)?,
        restart_policy: row.get(9)?,
        health_url: row.get(10)?,
        tunnel_provider: row.get(11)?,
        tunnel_url: row.get(12)?,
        paired_with: row.get(13)?,
        agent_id: row.get(14)?,
        metadata: json_column(row, 15)?,
    })
}

fn is_unique_violation(e: &tokio_rusqlite::Error) -> bool {
    matches!(
        e,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
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
        registry: ServicesRegistry,
        clock: Arc<ManualClock>,
        probe: Arc<StaticProbe>,
        store: Store,
    }

    async fn fixture() -> Fixture {
        fixture_with_range(3100, 3200).await
    }

    async fn fixture_with_range(start: u16, end: u16) -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let probe = StaticProbe::new();
        let activity = ActivityLog::new(store.clone(), clock.clone());
        let ports = PortsConfig {
            range_start: start,
            range_end: end,
            reserved: vec![3105],
        };
        let registry = ServicesRegistry::new(
            store.clone(),
            clock.clone(),
            probe.clone(),
            EventBus::new(),
            activity,
            ports,
            10 * 1024,
        );
        Fixture {
            registry,
            clock,
            probe,
            store,
        }
    }

    fn claim_for(id: &str) -> ClaimRequest {
        ClaimRequest {
            id: id.into(),
            pid: Some(999),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_claim_renew_release() {
        let f = fixture().await;
        f.probe.set_alive(999, true);

        let first = f.registry.claim(claim_for("myapp:api:main")).await.unwrap();
        assert_eq!(first.port, Some(3100));
        assert!(!first.existing);

        let second = f.registry.claim(claim_for("myapp:api:main")).await.unwrap();
        assert_eq!(second.port, Some(3100));
        assert!(second.existing);

        let released = f
            .registry
            .release(ReleaseRequest {
                id: Some("myapp:api:main".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(released.released, 1);
        assert_eq!(released.released_ports, vec![3100]);
    }

    #[tokio::test]
    async fn scan_skips_reserved_db_and_os_ports() {
        let f = fixture().await;
        f.probe.set_alive(999, true);
        f.probe.bind_port(3101);

        let a = f.registry.claim(claim_for("a")).await.unwrap();
        assert_eq!(a.port, Some(3100));
        // 3101 is OS-held, 3100 DB-held
        let b = f.registry.claim(claim_for("b")).await.unwrap();
        assert_eq!(b.port, Some(3102));
        // preferred reserved port is refused outright
        let err = f
            .registry
            .claim(ClaimRequest {
                port: Some(3105),
                ..claim_for("c")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ReservedPort(3105)));
        // 3103 onwards skips the reserved 3105 during the scan
        let c = f.registry.claim(claim_for("c")).await.unwrap();
        assert_eq!(c.port, Some(3103));
        let d = f.registry.claim(claim_for("d")).await.unwrap();
        assert_eq!(d.port, Some(3104));
        let e = f.registry.claim(claim_for("e")).await.unwrap();
        assert_eq!(e.port, Some(3106));
    }

    #[tokio::test]
    async fn preferred_port_held_by_os_falls_back_to_scan() {
        let f = fixture().await;
        f.probe.bind_port(3110);
        let out = f
            .registry
            .claim(ClaimRequest {
                port: Some(3110),
                ..claim_for("a")
            })
            .await
            .unwrap();
        assert_eq!(out.port, Some(3100));
    }

    #[tokio::test]
    async fn out_of_range_preferred_port_is_rejected() {
        let f = fixture().await;
        let err = f
            .registry
            .claim(ClaimRequest {
                port: Some(9000),
                ..claim_for("a")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::OutOfRangePort { port: 9000, .. }));
    }

    #[tokio::test]
    async fn exhausted_range_reports_no_free_port() {
        let f = fixture_with_range(3100, 3100).await;
        f.probe.set_alive(999, true);
        f.registry.claim(claim_for("a")).await.unwrap();
        let err = f.registry.claim(claim_for("b")).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NoFreePort {
                start: 3100,
                end: 3100
            }
        ));
    }

    #[tokio::test]
    async fn stale_row_with_dead_pid_is_replaced() {
        let f = fixture().await;
        f.probe.set_alive(999, false);
        let first = f.registry.claim(claim_for("a")).await.unwrap();
        assert!(!first.existing);
        // Same identity, dead pid: a fresh claim, not a renewal.
        let again = f.registry.claim(claim_for("a")).await.unwrap();
        assert!(!again.existing);
        assert_eq!(again.port, Some(3100));
    }

    #[tokio::test]
    async fn expired_row_is_replaced() {
        let f = fixture().await;
        f.probe.set_alive(999, true);
        let req = ClaimRequest {
            expires_at: Some(1_500),
            ..claim_for("a")
        };
        f.registry.claim(req).await.unwrap();
        f.clock.advance(1_000);
        let again = f.registry.claim(claim_for("a")).await.unwrap();
        assert!(!again.existing);
    }

    #[tokio::test]
    async fn release_by_pattern_and_expired() {
        let f = fixture().await;
        f.probe.set_alive(999, true);
        f.registry.claim(claim_for("myapp:api")).await.unwrap();
        f.registry.claim(claim_for("myapp:web")).await.unwrap();
        f.registry.claim(claim_for("other:api")).await.unwrap();

        let out = f
            .registry
            .release(ReleaseRequest {
                pattern: Some("myapp:*".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.released, 2);

        f.registry
            .claim(ClaimRequest {
                expires_at: Some(1_100),
                ..claim_for("temp:svc")
            })
            .await
            .unwrap();
        f.clock.advance(500);
        let out = f
            .registry
            .release(ReleaseRequest {
                expired: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.released, 1);
        assert!(f.registry.get("temp:svc").await.unwrap().is_none());
        assert!(f.registry.get("other:api").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_port_claim_has_null_port() {
        let f = fixture().await;
        let out = f
            .registry
            .claim(ClaimRequest {
                no_port: true,
                ..claim_for("worker:bg")
            })
            .await
            .unwrap();
        assert_eq!(out.port, None);
        // Two port-less workers never collide.
        let out2 = f
            .registry
            .claim(ClaimRequest {
                no_port: true,
                ..claim_for("worker:bg2")
            })
            .await
            .unwrap();
        assert_eq!(out2.port, None);
    }

    #[tokio::test]
    async fn quota_blocks_claim_at_max() {
        let f = fixture().await;
        f.store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO agents (id, registered_at, last_heartbeat, max_services, max_locks)
                     VALUES ('a1', 1, 1, 1, 1)",
                    [],
                )
            })
            .await
            .unwrap();
        let req = ClaimRequest {
            agent_id: Some("a1".into()),
            ..claim_for("svc:one")
        };
        f.registry.claim(req).await.unwrap();
        let err = f
            .registry
            .claim(ClaimRequest {
                agent_id: Some("a1".into()),
                ..claim_for("svc:two")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::QuotaExceeded { max: 1, .. }));
    }

    /// A probe whose enumeration snapshot is blind to a port the direct
    /// connect probe sees bound, emulating a binder racing the claim.
    struct RacingProbe {
        bound: u16,
    }

    #[async_trait::async_trait]
    impl Probe for RacingProbe {
        async fn pid_alive(&self, _pid: i64) -> bool {
            true
        }
        async fn listeners(&self) -> Result<Vec<pd_probe::SystemListener>, pd_probe::ProbeError> {
            Ok(Vec::new())
        }
        async fn port_in_use(&self, port: u16) -> bool {
            port == self.bound
        }
    }

    #[tokio::test]
    async fn out_of_band_binder_forces_retry() {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let activity = ActivityLog::new(store.clone(), clock.clone());
        let registry = ServicesRegistry::new(
            store,
            clock,
            Arc::new(RacingProbe { bound: 3100 }),
            EventBus::new(),
            activity,
            PortsConfig {
                range_start: 3100,
                range_end: 3200,
                reserved: vec![],
            },
            10 * 1024,
        );
        // Scan picks 3100 (snapshot is blind), the post-insert re-check sees
        // it bound, and the retry lands on 3101.
        let out = registry.claim(claim_for("a")).await.unwrap();
        assert_eq!(out.port, Some(3101));
    }

    #[tokio::test]
    async fn endpoints_upsert_and_validate() {
        let f = fixture().await;
        f.registry.claim(claim_for("myapp:api")).await.unwrap();

        let ep = f
            .registry
            .set_endpoint("myapp:api", "dev", "http://localhost:3100")
            .await
            .unwrap();
        assert_eq!(ep.env, "dev");
        f.registry
            .set_endpoint("myapp:api", "dev", "wss://localhost:3100/ws")
            .await
            .unwrap();
        let eps = f.registry.endpoints("myapp:api").await.unwrap();
        assert_eq!(eps.len(), 1);
        assert!(eps[0].url.starts_with("wss://"));

        assert!(matches!(
            f.registry.set_endpoint("myapp:api", "dev", "ftp://x").await,
            Err(RegistryError::InvalidUrl(_))
        ));
        assert!(matches!(
            f.registry.set_endpoint("myapp:api", "DEV", "http://x").await,
            Err(RegistryError::InvalidEnv(_))
        ));
        assert!(matches!(
            f.registry.set_endpoint("nope", "dev", "http://x").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn find_filters() {
        let f = fixture().await;
        f.probe.set_alive(999, true);
        f.registry.claim(claim_for("myapp:api")).await.unwrap();
        f.registry.claim(claim_for("myapp:web")).await.unwrap();
        f.registry.claim(claim_for("other:api")).await.unwrap();

        let all = f.registry.find(ServiceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let mine = f
            .registry
            .find(ServiceFilter {
                pattern: Some("myapp:*".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);

        let by_port = f
            .registry
            .find(ServiceFilter {
                port: Some(3100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_port.len(), 1);
        assert_eq!(by_port[0].id, "myapp:api");
    }

    #[tokio::test]
    async fn invalid_identity_is_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.registry.claim(claim_for("not a name")).await,
            Err(RegistryError::InvalidIdentity(_))
        ));
        assert!(matches!(
            f.registry.claim(claim_for("a:b:c:d")).await,
            Err(RegistryError::InvalidIdentity(_))
        ));
    }
}
