//! Named advisory locks with owner and TTL. At any instant at most one live
//! row exists per name; expired rows are replaceable by the next acquire.
//! Re-acquire by the current owner is an idempotent refresh.

use std::sync::Arc;

use tracing::{debug, info};

use pd_bus::{DaemonEvent, EventBus};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::identity;
use pd_core::store::{json_column, json_param, Store, StoreError};
use pd_core::types::{ActivityKind, Lock};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("invalid lock name: {0}")]
    BadName(String),

    #[error("ttl must be positive and at most {max_ms} ms")]
    BadTtl { max_ms: i64 },

    #[error("lock held")]
    Held { owner: String, expires_at: i64 },

    #[error("agent {owner} has reached its lock quota ({max})")]
    QuotaExceeded { owner: String, max: i64 },

    #[error("lock not found: {0}")]
    NotFound(String),

    #[error("lock is owned by {owner}")]
    NotOwner { owner: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct LockManager {
    store: Store,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    activity: ActivityLog,
    max_ttl_ms: i64,
}

/// Outcome of a transactional lock mutation, mapped to errors outside.
enum TxOutcome {
    Acquired(Lock),
    Refreshed(Lock),
    Held { owner: String, expires_at: i64 },
}

impl LockManager {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        activity: ActivityLog,
        max_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            clock,
            bus,
            activity,
            max_ttl_ms,
        }
    }

    /// Acquire `name` for `owner` with the given TTL. Succeeds when the name
    /// is vacant, its current row has expired, or the caller already owns it
    /// (refresh). Conflicts report the current owner and expiry.
    pub async fn acquire(
        &self,
        name: &str,
        owner: &str,
        pid: Option<i64>,
        ttl_ms: i64,
        metadata: Option<serde_json::Value>,
    ) -> Result<Lock, LockError> {
        identity::validate_name(name).map_err(|_| LockError::BadName(name.to_string()))?;
        if ttl_ms <= 0 || ttl_ms > self.max_ttl_ms {
            return Err(LockError::BadTtl {
                max_ms: self.max_ttl_ms,
            });
        }

        self.quota_check(name, owner).await?;

        let now = self.clock.now_ms();
        let expires_at = now + ttl_ms;
        let name_owned = name.to_string();
        let owner_owned = owner.to_string();
        let metadata_col = json_param(&metadata);

        let outcome = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<(String, i64)> = {
                    let mut stmt =
                        tx.prepare("SELECT owner, expires_at FROM locks WHERE name = ?1")?;
                    let mut rows = stmt.query([&name_owned])?;
                    match rows.next()? {
                        Some(row) => Some((row.get(0)?, row.get(1)?)),
                        None => None,
                    }
                };
                let outcome = match current {
                    Some((holder, holder_expires))
                        if holder_expires > now && holder != owner_owned =>
                    {
                        TxOutcome::Held {
                            owner: holder,
                            expires_at: holder_expires,
                        }
                    }
                    Some((_, holder_expires)) if holder_expires > now => {
                        // Same owner: idempotent refresh.
                        tx.execute(
                            "UPDATE locks SET expires_at = ?2, pid = COALESCE(?3, pid)
                             WHERE name = ?1",
                            rusqlite::params![name_owned, expires_at, pid],
                        )?;
                        TxOutcome::Refreshed(read_lock_tx(&tx, &name_owned)?)
                    }
                    _ => {
                        tx.execute(
                            "INSERT INTO locks (name, owner, pid, acquired_at, expires_at, metadata)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                             ON CONFLICT(name) DO UPDATE SET
                                owner = excluded.owner, pid = excluded.pid,
                                acquired_at = excluded.acquired_at,
                                expires_at = excluded.expires_at,
                                metadata = excluded.metadata",
                            rusqlite::params![
                                name_owned,
                                owner_owned,
                                pid,
                                now,
                                expires_at,
                                metadata_col
                            ],
                        )?;
                        TxOutcome::Acquired(read_lock_tx(&tx, &name_owned)?)
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        match outcome {
            TxOutcome::Held { owner, expires_at } => Err(LockError::Held { owner, expires_at }),
            TxOutcome::Refreshed(lock) => {
                debug!(name, owner, "lock refreshed");
                Ok(lock)
            }
            TxOutcome::Acquired(lock) => {
                self.activity
                    .record(
                        ActivityKind::LockAcquire,
                        Some(owner.to_string()),
                        Some(name.to_string()),
                        None,
                        None,
                    )
                    .await?;
                self.bus.publish(DaemonEvent::new(
                    "lock.acquire",
                    Some(name.to_string()),
                    now,
                    serde_json::json!({"owner": owner, "expiresAt": lock.expires_at}),
                ));
                info!(name, owner, "lock acquired");
                Ok(lock)
            }
        }
    }

    /// Enforce `max_locks` for registered agents. The name being acquired
    /// is excluded from the count so refreshing a held lock never trips the
    /// quota.
    async fn quota_check(&self, name: &str, owner: &str) -> Result<(), LockError> {
        let now = self.clock.now_ms();
        let name_owned = name.to_string();
        let owner_owned = owner.to_string();
        let check = self
            .store
            .call(move |conn| {
                let max: Option<i64> = conn
                    .query_row(
                        "SELECT max_locks FROM agents WHERE id = ?1",
                        [&owner_owned],
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
                    "SELECT COUNT(*) FROM locks
                     WHERE owner = ?1 AND expires_at > ?2 AND name != ?3",
                    rusqlite::params![owner_owned, now, name_owned],
                    |r| r.get(0),
                )?;
                Ok(Some((count, max)))
            })
            .await?;
        if let Some((count, max)) = check {
            if count >= max {
                return Err(LockError::QuotaExceeded {
                    owner: owner.to_string(),
                    max,
                });
            }
        }
        Ok(())
    }

    /// Release `name`. The owner check is bypassed with `force`.
    pub async fn release(&self, name: &str, owner: &str, force: bool) -> Result<(), LockError> {
        let now = self.clock.now_ms();
        let name_owned = name.to_string();
        let owner_owned = owner.to_string();
        let released = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = {
                    let mut stmt = tx.prepare("SELECT owner FROM locks WHERE name = ?1")?;
                    let mut rows = stmt.query([&name_owned])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let outcome = match current {
                    None => None,
                    Some(holder) if holder != owner_owned && !force => Some(Err(holder)),
                    Some(_) => {
                        tx.execute("DELETE FROM locks WHERE name = ?1", [&name_owned])?;
                        Some(Ok(()))
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        match released {
            None => Err(LockError::NotFound(name.to_string())),
            Some(Err(holder)) => Err(LockError::NotOwner { owner: holder }),
            Some(Ok(())) => {
                self.activity
                    .record(
                        ActivityKind::LockRelease,
                        Some(owner.to_string()),
                        Some(name.to_string()),
                        force.then(|| "forced".to_string()),
                        None,
                    )
                    .await?;
                self.bus.publish(DaemonEvent::new(
                    "lock.release",
                    Some(name.to_string()),
                    now,
                    serde_json::json!({"owner": owner, "forced": force}),
                ));
                info!(name, owner, force, "lock released");
                Ok(())
            }
        }
    }

    /// Shift `expires_at` to `now + ttl` when the caller owns the lock (or
    /// forces).
    pub async fn extend(
        &self,
        name: &str,
        owner: &str,
        ttl_ms: i64,
        force: bool,
    ) -> Result<Lock, LockError> {
        if ttl_ms <= 0 || ttl_ms > self.max_ttl_ms {
            return Err(LockError::BadTtl {
                max_ms: self.max_ttl_ms,
            });
        }
        let now = self.clock.now_ms();
        let expires_at = now + ttl_ms;
        let name_owned = name.to_string();
        let owner_owned = owner.to_string();
        let outcome = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<(String, i64)> = {
                    let mut stmt =
                        tx.prepare("SELECT owner, expires_at FROM locks WHERE name = ?1")?;
                    let mut rows = stmt.query([&name_owned])?;
                    match rows.next()? {
                        Some(row) => Some((row.get(0)?, row.get(1)?)),
                        None => None,
                    }
                };
                let outcome = match current {
                    None => None,
                    // An expired lock cannot be extended.
                    Some((_, holder_expires)) if holder_expires <= now => None,
                    Some((holder, _)) if holder != owner_owned && !force => Some(Err(holder)),
                    Some(_) => {
                        tx.execute(
                            "UPDATE locks SET expires_at = ?2 WHERE name = ?1",
                            rusqlite::params![name_owned, expires_at],
                        )?;
                        Some(Ok(read_lock_tx(&tx, &name_owned)?))
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        match outcome {
            None => Err(LockError::NotFound(name.to_string())),
            Some(Err(holder)) => Err(LockError::NotOwner { owner: holder }),
            Some(Ok(lock)) => Ok(lock),
        }
    }

    /// The live row for `name`, or `None` (vacant or expired).
    pub async fn check(&self, name: &str) -> Result<Option<Lock>, LockError> {
        let now = self.clock.now_ms();
        let name = name.to_string();
        let lock = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_LOCK} WHERE name = ?1 AND expires_at > ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![name, now])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_lock(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(lock)
    }

    /// All live locks, optionally filtered by owner.
    pub async fn list(&self, owner: Option<String>) -> Result<Vec<Lock>, LockError> {
        let now = self.clock.now_ms();
        self.store
            .call(move |conn| {
                let mut sql = format!("{SELECT_LOCK} WHERE expires_at > ?1");
                if owner.is_some() {
                    sql.push_str(" AND owner = ?2");
                }
                sql.push_str(" ORDER BY name");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match &owner {
                    Some(o) => stmt.query(rusqlite::params![now, o])?,
                    None => stmt.query(rusqlite::params![now])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_lock(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(LockError::from)
    }

    /// Reaper hook: drop expired rows. Returns the count removed.
    pub async fn trim_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        self.store
            .call(move |conn| conn.execute("DELETE FROM locks WHERE expires_at <= ?1", [now]))
            .await
    }
}

/// Delete every lock owned by `owner` inside an open transaction. Returns
/// the released names.
pub fn release_locks_by_owner_tx(
    tx: &rusqlite::Transaction<'_>,
    owner: &str,
) -> rusqlite::Result<Vec<String>> {
    let names = {
        let mut stmt = tx.prepare("SELECT name FROM locks WHERE owner = ?1")?;
        let mut rows = stmt.query([owner])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        out
    };
    tx.execute("DELETE FROM locks WHERE owner = ?1", [owner])?;
    Ok(names)
}

const SELECT_LOCK: &str =
    "SELECT name, owner, pid, acquired_at, expires_at, metadata FROM locks";

fn read_lock_tx(tx: &rusqlite::Transaction<'_>, name: &str) -> rusqlite::Result<Lock> {
    let mut stmt = tx.prepare(&format!("{SELECT_LOCK} WHERE name = ?1"))?;
    stmt.query_row([name], row_to_lock)
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
    Ok(Lock {
        name: row.get(0)?,
        owner: row.get(1)?,
        pid: row.get(2)?,
        acquired_at: row.get(3)?,
        expires_at: row.get(4)?,
        metadata: json_column(row, 5)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
