//! Sessions, append-only notes, and advisory file claims. A session is the
//! unit of agent work: mutable while `active`, terminal once completed or
//! abandoned. Leaving `active` soft-releases every file claim and freezes
//! the note log.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use pd_bus::{DaemonEvent, EventBus};
use pd_core::activity::ActivityLog;
use pd_core::clock::Clock;
use pd_core::store::{Store, StoreError};
use pd_core::types::{ActivityKind, FileClaim, Session, SessionNote, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("purpose is required")]
    EmptyPurpose,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("agent {agent_id} already has an active session ({session_id})")]
    ActiveSessionExists {
        agent_id: String,
        session_id: String,
    },

    #[error("file claims conflict with active sessions")]
    FileConflict { conflicts: Vec<FileClaim> },

    #[error("session {0} is not active")]
    NotActive(String),

    #[error("invalid transition from {from} to {to}")]
    BadTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionOutcome {
    pub session: Session,
    /// Conflicts recorded when `force` overrode them (empty otherwise).
    pub overridden_conflicts: Vec<FileClaim>,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    activity: ActivityLog,
    single_active_session: bool,
}

impl SessionManager {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        activity: ActivityLog,
        single_active_session: bool,
    ) -> Self {
        Self {
            store,
            clock,
            bus,
            activity,
            single_active_session,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a session, optionally claiming files up front. Overlapping
    /// claims from other active sessions are a conflict unless `force`.
    pub async fn start(
        &self,
        purpose: &str,
        agent_id: Option<String>,
        files: Vec<String>,
        force: bool,
    ) -> Result<StartSessionOutcome, SessionError> {
        if purpose.trim().is_empty() {
            return Err(SessionError::EmptyPurpose);
        }
        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();

        if self.single_active_session {
            if let Some(agent) = &agent_id {
                let agent = agent.clone();
                let existing: Option<String> = self
                    .store
                    .call(move |conn| {
                        // The implicit quick-notes session does not count as
                        // a unit of work here.
                        let mut stmt = conn.prepare(
                            "SELECT id FROM sessions
                             WHERE agent_id = ?1 AND status = 'active'
                               AND purpose != 'quick-notes'",
                        )?;
                        let mut rows = stmt.query([&agent])?;
                        match rows.next()? {
                            Some(row) => Ok(Some(row.get(0)?)),
                            None => Ok(None),
                        }
                    })
                    .await?;
                if let Some(session_id) = existing {
                    return Err(SessionError::ActiveSessionExists {
                        agent_id: agent_id.unwrap_or_default(),
                        session_id,
                    });
                }
            }
        }

        let conflicts = self.conflicting_claims(&files, None).await?;
        if !conflicts.is_empty() && !force {
            return Err(SessionError::FileConflict { conflicts });
        }

        let row_id = id.clone();
        let row_purpose = purpose.to_string();
        let row_agent = agent_id.clone();
        let row_files = files.clone();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO sessions (id, purpose, status, agent_id, created_at, updated_at)
                     VALUES (?1, ?2, 'active', ?3, ?4, ?4)",
                    rusqlite::params![row_id, row_purpose, row_agent, now],
                )?;
                for path in &row_files {
                    tx.execute(
                        "INSERT OR IGNORE INTO session_files (session_id, file_path, claimed_at)
                         VALUES (?1, ?2, ?3)",
                        rusqlite::params![row_id, path, now],
                    )?;
                }
                tx.commit()
            })
            .await?;

        self.activity
            .record(
                ActivityKind::SessionStart,
                agent_id.clone(),
                Some(id.clone()),
                Some(purpose.to_string()),
                None,
            )
            .await?;
        self.bus.publish(DaemonEvent::new(
            "session.start",
            Some(id.clone()),
            now,
            serde_json::json!({"purpose": purpose, "agentId": agent_id}),
        ));
        info!(session_id = %id, "session started");
        let session = self
            .get(&id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(StartSessionOutcome {
            session,
            overridden_conflicts: conflicts,
        })
    }

    /// Transition `active -> completed | abandoned`. Terminal states stamp
    /// `released_at` on every open file claim.
    pub async fn update(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<Session, SessionError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if current.status != SessionStatus::Active || status == SessionStatus::Active {
            return Err(SessionError::BadTransition {
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let now = self.clock.now_ms();
        let id_owned = id.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE sessions SET status = ?2, updated_at = ?3, completed_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id_owned, status.as_str(), now],
                )?;
                tx.execute(
                    "UPDATE session_files SET released_at = ?2
                     WHERE session_id = ?1 AND released_at IS NULL",
                    rusqlite::params![id_owned, now],
                )?;
                tx.commit()
            })
            .await?;

        self.activity
            .record(
                ActivityKind::SessionUpdate,
                current.agent_id.clone(),
                Some(id.to_string()),
                Some(status.as_str().to_string()),
                None,
            )
            .await?;
        self.bus.publish(DaemonEvent::new(
            "session.update",
            Some(id.to_string()),
            now,
            serde_json::json!({"status": status.as_str()}),
        ));
        self.get(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Hard delete, cascading notes and claims. Error recovery, not normal
    /// lifecycle.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let id_owned = id.to_string();
        let removed = self
            .store
            .call(move |conn| conn.execute("DELETE FROM sessions WHERE id = ?1", [id_owned]))
            .await?;
        if removed == 0 {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.activity
            .record(
                ActivityKind::SessionDelete,
                None,
                Some(id.to_string()),
                None,
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let id = id.to_string();
        let session = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_SESSION} WHERE id = ?1"))?;
                let mut rows = stmt.query([id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(session)
    }

    pub async fn list(
        &self,
        status: Option<SessionStatus>,
        agent_id: Option<String>,
    ) -> Result<Vec<Session>, SessionError> {
        self.store
            .call(move |conn| {
                let mut sql = format!("{SELECT_SESSION} WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(status) = status {
                    sql.push_str(" AND status = ?");
                    params.push(Box::new(status.as_str().to_string()));
                }
                if let Some(agent) = agent_id {
                    sql.push_str(" AND agent_id = ?");
                    params.push(Box::new(agent));
                }
                sql.push_str(" ORDER BY created_at DESC");
                let mut stmt = conn.prepare(&sql)?;
                let refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(SessionError::from)
    }

    // -----------------------------------------------------------------------
    // Notes
    // -----------------------------------------------------------------------

    /// Append a note to an active session. Notes are immutable once written.
    pub async fn add_note(
        &self,
        session_id: &str,
        content: &str,
        kind: Option<String>,
    ) -> Result<SessionNote, SessionError> {
        let session = self
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive(session_id.to_string()));
        }
        let now = self.clock.now_ms();
        let sid = session_id.to_string();
        let content_owned = content.to_string();
        let kind = kind.unwrap_or_else(|| "note".to_string());
        let kind_owned = kind.clone();
        let note_id = self
            .store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO session_notes (session_id, content, type, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![sid, content_owned, kind_owned, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(SessionNote {
            id: note_id,
            session_id: session_id.to_string(),
            content: content.to_string(),
            kind,
            created_at: now,
        })
    }

    pub async fn notes(
        &self,
        session_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<SessionNote>, SessionError> {
        let sid = session_id.to_string();
        let limit = limit.unwrap_or(100).clamp(1, 1000);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, content, type, created_at FROM session_notes
                     WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![sid, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_note(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(SessionError::from)
    }

    /// Notes across all sessions, newest first.
    pub async fn recent_notes(&self, limit: Option<i64>) -> Result<Vec<SessionNote>, SessionError> {
        let limit = limit.unwrap_or(50).clamp(1, 1000);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, content, type, created_at FROM session_notes
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query([limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_note(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(SessionError::from)
    }

    /// Post a note without a session: reuses the caller's implicit
    /// quick-note session, creating it on first use.
    pub async fn quick_note(
        &self,
        agent_id: Option<String>,
        content: &str,
        kind: Option<String>,
    ) -> Result<SessionNote, SessionError> {
        let owner = agent_id.clone().unwrap_or_else(|| "anonymous".to_string());
        let owner_query = owner.clone();
        let existing: Option<String> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM sessions
                     WHERE agent_id = ?1 AND status = 'active' AND purpose = 'quick-notes'",
                )?;
                let mut rows = stmt.query([&owner_query])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;

        let session_id = match existing {
            Some(id) => id,
            None => {
                // The implicit session bypasses the one-active-session rule;
                // it is bookkeeping, not a unit of work.
                let now = self.clock.now_ms();
                let id = Uuid::new_v4().to_string();
                let row_id = id.clone();
                self.store
                    .call(move |conn| {
                        conn.execute(
                            "INSERT INTO sessions
                                (id, purpose, status, agent_id, created_at, updated_at)
                             VALUES (?1, 'quick-notes', 'active', ?2, ?3, ?3)",
                            rusqlite::params![row_id, owner, now],
                        )?;
                        Ok(())
                    })
                    .await?;
                id
            }
        };
        self.add_note(&session_id, content, kind).await
    }

    /// Reaper hook: delete notes older than the retention window on
    /// completed/abandoned sessions.
    pub async fn trim_notes(&self, retention_ms: i64) -> Result<usize, StoreError> {
        let cutoff = self.clock.now_ms() - retention_ms;
        self.store
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM session_notes WHERE created_at < ?1 AND session_id IN (
                         SELECT id FROM sessions WHERE status != 'active'
                     )",
                    [cutoff],
                )
            })
            .await
    }

    // -----------------------------------------------------------------------
    // File claims
    // -----------------------------------------------------------------------

    /// Add paths to an active session, conflict-checked against other
    /// active sessions' open claims.
    pub async fn claim_files(
        &self,
        session_id: &str,
        paths: Vec<String>,
        force: bool,
    ) -> Result<Vec<FileClaim>, SessionError> {
        let session = self
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive(session_id.to_string()));
        }
        let conflicts = self.conflicting_claims(&paths, Some(session_id)).await?;
        if !conflicts.is_empty() && !force {
            return Err(SessionError::FileConflict { conflicts });
        }
        let now = self.clock.now_ms();
        let sid = session_id.to_string();
        let path_rows = paths.clone();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                for path in &path_rows {
                    tx.execute(
                        "INSERT INTO session_files (session_id, file_path, claimed_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(session_id, file_path) DO UPDATE SET
                            claimed_at = excluded.claimed_at, released_at = NULL",
                        rusqlite::params![sid, path, now],
                    )?;
                }
                tx.commit()
            })
            .await?;
        self.files(session_id).await
    }

    /// Soft-release paths (stamp `released_at`).
    pub async fn release_files(
        &self,
        session_id: &str,
        paths: Vec<String>,
    ) -> Result<Vec<FileClaim>, SessionError> {
        let now = self.clock.now_ms();
        let sid = session_id.to_string();
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                for path in &paths {
                    tx.execute(
                        "UPDATE session_files SET released_at = ?3
                         WHERE session_id = ?1 AND file_path = ?2 AND released_at IS NULL",
                        rusqlite::params![sid, path, now],
                    )?;
                }
                tx.commit()
            })
            .await?;
        self.files(session_id).await
    }

    /// The current claim set for a session (open and released).
    pub async fn files(&self, session_id: &str) -> Result<Vec<FileClaim>, SessionError> {
        let sid = session_id.to_string();
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, file_path, claimed_at, released_at
                     FROM session_files WHERE session_id = ?1 ORDER BY file_path",
                )?;
                let mut rows = stmt.query([sid])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(FileClaim {
                        session_id: row.get(0)?,
                        file_path: row.get(1)?,
                        claimed_at: row.get(2)?,
                        released_at: row.get(3)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(SessionError::from)
    }

    /// Open claims on `paths` held by other active sessions.
    async fn conflicting_claims(
        &self,
        paths: &[String],
        exclude_session: Option<&str>,
    ) -> Result<Vec<FileClaim>, SessionError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let paths = paths.to_vec();
        let exclude = exclude_session.map(str::to_string);
        self.store
            .call(move |conn| {
                let mut out = Vec::new();
                let mut stmt = conn.prepare(
                    "SELECT f.session_id, f.file_path, f.claimed_at, f.released_at
                     FROM session_files f
                     JOIN sessions s ON s.id = f.session_id
                     WHERE f.file_path = ?1 AND f.released_at IS NULL
                       AND s.status = 'active' AND f.session_id != ?2",
                )?;
                for path in &paths {
                    let exclude = exclude.clone().unwrap_or_default();
                    let mut rows = stmt.query(rusqlite::params![path, exclude])?;
                    while let Some(row) = rows.next()? {
                        out.push(FileClaim {
                            session_id: row.get(0)?,
                            file_path: row.get(1)?,
                            claimed_at: row.get(2)?,
                            released_at: row.get(3)?,
                        });
                    }
                }
                Ok(out)
            })
            .await
            .map_err(SessionError::from)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers used by the agent cleanup path
// ---------------------------------------------------------------------------

/// Abandon every active session of `agent_id` inside an open transaction,
/// releasing its file claims. Returns the abandoned session ids.
pub fn abandon_active_sessions_tx(
    tx: &rusqlite::Transaction<'_>,
    agent_id: &str,
    now: i64,
) -> rusqlite::Result<Vec<String>> {
    let ids = {
        let mut stmt =
            tx.prepare("SELECT id FROM sessions WHERE agent_id = ?1 AND status = 'active'")?;
        let mut rows = stmt.query([agent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        out
    };
    for id in &ids {
        tx.execute(
            "UPDATE sessions SET status = 'abandoned', updated_at = ?2, completed_at = ?2
             WHERE id = ?1",
            rusqlite::params![id, now],
        )?;
        tx.execute(
            "UPDATE session_files SET released_at = ?2
             WHERE session_id = ?1 AND released_at IS NULL",
            rusqlite::params![id, now],
        )?;
    }
    Ok(ids)
}

/// The most recent notes across an agent's sessions, for resurrection
/// context capture.
pub fn recent_notes_for_agent_tx(
    tx: &rusqlite::Transaction<'_>,
    agent_id: &str,
    limit: i64,
) -> rusqlite::Result<Vec<SessionNote>> {
    let mut stmt = tx.prepare(
        "SELECT n.id, n.session_id, n.content, n.type, n.created_at
         FROM session_notes n
         JOIN sessions s ON s.id = n.session_id
         WHERE s.agent_id = ?1
         ORDER BY n.id DESC LIMIT ?2",
    )?;
    let mut rows = stmt.query(rusqlite::params![agent_id, limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_note(row)?);
    }
    Ok(out)
}

const SELECT_SESSION: &str =
    "SELECT id, purpose, status, agent_id, created_at, updated_at, completed_at FROM sessions";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    Ok(Session {
        id: row.get(0)?,
        purpose: row.get(1)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        agent_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        completed_at: row.get(6)?,
    })
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionNote> {
    Ok(SessionNote {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        kind: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::clock::ManualClock;

    async fn manager() -> (SessionManager, Arc<ManualClock>) {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let activity = ActivityLog::new(store.clone(), clock.clone());
        (
            SessionManager::new(store, clock.clone(), EventBus::new(), activity, true),
            clock,
        )
    }

    #[tokio::test]
    async fn start_complete_releases_claims() {
        let (sessions, _) = manager().await;
        let started = sessions
            .start(
                "refactor auth",
                Some("a1".into()),
                vec!["src/auth.rs".into(), "src/lib.rs".into()],
                false,
            )
            .await
            .unwrap();
        let id = started.session.id.clone();
        assert!(started.overridden_conflicts.is_empty());

        let files = sessions.files(&id).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.released_at.is_none()));

        let done = sessions.update(&id, SessionStatus::Completed).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.completed_at.is_some());

        let files = sessions.files(&id).await.unwrap();
        assert!(files.iter().all(|f| f.released_at.is_some()));

        // Terminal sessions refuse new notes.
        assert!(matches!(
            sessions.add_note(&id, "late note", None).await,
            Err(SessionError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn overlapping_claims_conflict_unless_forced() {
        let (sessions, _) = manager().await;
        sessions
            .start("first", Some("a1".into()), vec!["src/main.rs".into()], false)
            .await
            .unwrap();

        let err = sessions
            .start("second", Some("a2".into()), vec!["src/main.rs".into()], false)
            .await
            .unwrap_err();
        match err {
            SessionError::FileConflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].file_path, "src/main.rs");
            }
            other => panic!("expected FileConflict, got {other:?}"),
        }

        // Forced claims proceed and record what they overrode.
        let forced = sessions
            .start("second", Some("a2".into()), vec!["src/main.rs".into()], true)
            .await
            .unwrap();
        assert_eq!(forced.overridden_conflicts.len(), 1);
    }

    #[tokio::test]
    async fn one_active_session_per_agent() {
        let (sessions, _) = manager().await;
        let first = sessions
            .start("work", Some("a1".into()), vec![], false)
            .await
            .unwrap();
        let err = sessions
            .start("more work", Some("a1".into()), vec![], false)
            .await
            .unwrap_err();
        match err {
            SessionError::ActiveSessionExists { session_id, .. } => {
                assert_eq!(session_id, first.session.id);
            }
            other => panic!("expected ActiveSessionExists, got {other:?}"),
        }

        sessions
            .update(&first.session.id, SessionStatus::Completed)
            .await
            .unwrap();
        sessions
            .start("more work", Some("a1".into()), vec![], false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_cascades_notes_and_claims() {
        let (sessions, _) = manager().await;
        let started = sessions
            .start("work", None, vec!["a.rs".into()], false)
            .await
            .unwrap();
        let id = started.session.id.clone();
        sessions.add_note(&id, "n1", None).await.unwrap();
        sessions.add_note(&id, "n2", Some("decision".into())).await.unwrap();

        sessions.delete(&id).await.unwrap();
        assert!(sessions.get(&id).await.unwrap().is_none());
        assert!(sessions.notes(&id, None).await.unwrap().is_empty());
        assert!(sessions.files(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notes_are_ordered_and_quick_notes_reuse_session() {
        let (sessions, clock) = manager().await;
        let n1 = sessions
            .quick_note(Some("a1".into()), "first", None)
            .await
            .unwrap();
        clock.advance(10);
        let n2 = sessions
            .quick_note(Some("a1".into()), "second", Some("todo".into()))
            .await
            .unwrap();
        assert_eq!(n1.session_id, n2.session_id);
        assert!(n2.id > n1.id);

        let recent = sessions.recent_notes(Some(10)).await.unwrap();
        assert_eq!(recent[0].content, "second");
        assert_eq!(recent[0].kind, "todo");
        assert_eq!(recent[1].content, "first");
    }

    #[tokio::test]
    async fn claim_and_release_files_on_live_session() {
        let (sessions, _) = manager().await;
        let started = sessions
            .start("work", Some("a1".into()), vec![], false)
            .await
            .unwrap();
        let id = started.session.id.clone();

        let files = sessions
            .claim_files(&id, vec!["x.rs".into(), "y.rs".into()], false)
            .await
            .unwrap();
        assert_eq!(files.len(), 2);

        let files = sessions
            .release_files(&id, vec!["x.rs".into()])
            .await
            .unwrap();
        let x = files.iter().find(|f| f.file_path == "x.rs").unwrap();
        assert!(x.released_at.is_some());
        let y = files.iter().find(|f| f.file_path == "y.rs").unwrap();
        assert!(y.released_at.is_none());

        // A released path can be claimed by another session without force.
        let other = sessions
            .start("other", Some("a2".into()), vec!["x.rs".into()], false)
            .await
            .unwrap();
        assert!(other.overridden_conflicts.is_empty());
    }

    #[tokio::test]
    async fn bad_transitions_are_rejected() {
        let (sessions, _) = manager().await;
        let started = sessions.start("work", None, vec![], false).await.unwrap();
        let id = started.session.id.clone();
        sessions.update(&id, SessionStatus::Abandoned).await.unwrap();
        assert!(matches!(
            sessions.update(&id, SessionStatus::Completed).await,
            Err(SessionError::BadTransition { .. })
        ));
    }

    #[tokio::test]
    async fn trim_notes_only_touches_terminal_sessions() {
        let (sessions, clock) = manager().await;
        let live = sessions.start("live", None, vec![], false).await.unwrap();
        let done = sessions
            .start("done", Some("a9".into()), vec![], false)
            .await
            .unwrap();
        sessions.add_note(&live.session.id, "keep", None).await.unwrap();
        sessions.add_note(&done.session.id, "drop", None).await.unwrap();
        sessions
            .update(&done.session.id, SessionStatus::Completed)
            .await
            .unwrap();

        clock.advance(10_000);
        let removed = sessions.trim_notes(5_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sessions.notes(&live.session.id, None).await.unwrap().len(), 1);
    }
}
