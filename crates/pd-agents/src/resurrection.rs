//! The resurrection queue: context captured from dead agents, handed to
//! successors through an explicit claim step.
//!
//! State machine per entry:
//! `pending -> resurrecting (claim) -> completed (complete/register)`,
//! with `dismissed` reachable from `pending` or `resurrecting`, and
//! `abandon` returning a claimed entry to `pending`.

use std::sync::Arc;

use pd_core::clock::Clock;
use pd_core::store::{Store, StoreError};
use pd_core::types::{ResurrectionEntry, ResurrectionState};

#[derive(Debug, thiserror::Error)]
pub enum ResurrectionError {
    #[error("no resurrection entry for {0}")]
    NotFound(String),

    #[error("entry for {old_id} is {state}, expected {expected}")]
    WrongState {
        old_id: String,
        state: String,
        expected: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ResurrectionQueue {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl ResurrectionQueue {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Pending entries, optionally filtered by project, newest first.
    pub async fn pending(
        &self,
        project: Option<String>,
    ) -> Result<Vec<ResurrectionEntry>, ResurrectionError> {
        self.store
            .call(move |conn| {
                let mut sql = format!("{SELECT_ENTRY} WHERE state = 'pending'");
                if project.is_some() {
                    sql.push_str(" AND project = ?1");
                }
                sql.push_str(" ORDER BY created_at DESC");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match &project {
                    Some(p) => stmt.query([p])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(ResurrectionError::from)
    }

    pub async fn get(&self, old_id: &str) -> Result<Option<ResurrectionEntry>, ResurrectionError> {
        let old_id = old_id.to_string();
        let entry = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} WHERE old_id = ?1"))?;
                let mut rows = stmt.query([old_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(entry)
    }

    /// Claim a pending entry for `new_id`. Returns the captured context.
    pub async fn claim(
        &self,
        old_id: &str,
        new_id: &str,
    ) -> Result<ResurrectionEntry, ResurrectionError> {
        self.transition(
            old_id,
            &[ResurrectionState::Pending],
            ResurrectionState::Resurrecting,
            Some(new_id.to_string()),
        )
        .await
    }

    /// Mark a claimed entry done (the successor has the context).
    pub async fn complete(&self, old_id: &str) -> Result<ResurrectionEntry, ResurrectionError> {
        self.transition(
            old_id,
            &[ResurrectionState::Resurrecting],
            ResurrectionState::Completed,
            None,
        )
        .await
    }

    /// Give up a claim, returning the entry to the pending pool.
    pub async fn abandon(&self, old_id: &str) -> Result<ResurrectionEntry, ResurrectionError> {
        self.transition(
            old_id,
            &[ResurrectionState::Resurrecting],
            ResurrectionState::Pending,
            Some(String::new()),
        )
        .await
    }

    /// Drop an entry nobody will act on.
    pub async fn dismiss(&self, old_id: &str) -> Result<ResurrectionEntry, ResurrectionError> {
        self.transition(
            old_id,
            &[ResurrectionState::Pending, ResurrectionState::Resurrecting],
            ResurrectionState::Dismissed,
            None,
        )
        .await
    }

    /// Guarded state transition. `new_id`: `Some("")` clears the column,
    /// `Some(id)` sets it, `None` leaves it untouched.
    async fn transition(
        &self,
        old_id: &str,
        from: &[ResurrectionState],
        to: ResurrectionState,
        new_id: Option<String>,
    ) -> Result<ResurrectionEntry, ResurrectionError> {
        let now = self.clock.now_ms();
        let id = old_id.to_string();
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let expected = from.join("|");
        let outcome = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = {
                    let mut stmt =
                        tx.prepare("SELECT state FROM resurrection_queue WHERE old_id = ?1")?;
                    let mut rows = stmt.query([&id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let outcome = match current {
                    None => None,
                    Some(state) if !from.contains(&state.as_str()) => Some(Err(state)),
                    Some(_) => {
                        match &new_id {
                            Some(value) if value.is_empty() => {
                                tx.execute(
                                    "UPDATE resurrection_queue
                                     SET state = ?2, new_id = NULL, updated_at = ?3
                                     WHERE old_id = ?1",
                                    rusqlite::params![id, to.as_str(), now],
                                )?;
                            }
                            Some(value) => {
                                tx.execute(
                                    "UPDATE resurrection_queue
                                     SET state = ?2, new_id = ?3, updated_at = ?4
                                     WHERE old_id = ?1",
                                    rusqlite::params![id, to.as_str(), value, now],
                                )?;
                            }
                            None => {
                                tx.execute(
                                    "UPDATE resurrection_queue
                                     SET state = ?2, updated_at = ?3
                                     WHERE old_id = ?1",
                                    rusqlite::params![id, to.as_str(), now],
                                )?;
                            }
                        }
                        Some(Ok(()))
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        match outcome {
            None => Err(ResurrectionError::NotFound(old_id.to_string())),
            Some(Err(state)) => Err(ResurrectionError::WrongState {
                old_id: old_id.to_string(),
                state,
                expected,
            }),
            Some(Ok(())) => self
                .get(old_id)
                .await?
                .ok_or_else(|| ResurrectionError::NotFound(old_id.to_string())),
        }
    }
}

const SELECT_ENTRY: &str = "SELECT old_id, new_id, project, purpose, session_id, notes,
    state, created_at, updated_at FROM resurrection_queue";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResurrectionEntry> {
    let notes_raw: String = row.get(5)?;
    let state: String = row.get(6)?;
    Ok(ResurrectionEntry {
        old_id: row.get(0)?,
        new_id: row.get(1)?,
        project: row.get(2)?,
        purpose: row.get(3)?,
        session_id: row.get(4)?,
        notes: serde_json::from_str(&notes_raw).unwrap_or_default(),
        state: ResurrectionState::parse(&state).unwrap_or(ResurrectionState::Pending),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::clock::ManualClock;

    async fn queue_with_entry() -> ResurrectionQueue {
        let store = Store::open_in_memory().await.unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO resurrection_queue
                        (old_id, project, purpose, session_id, notes, state,
                         created_at, updated_at)
                     VALUES ('a1', 'myapp', 'build the thing', 's1',
                             '[{\"id\":1,\"sessionId\":\"s1\",\"content\":\"wip\",\
                               \"type\":\"note\",\"createdAt\":5}]',
                             'pending', 1, 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        ResurrectionQueue::new(store, Arc::new(ManualClock::at(2_000)))
    }

    #[tokio::test]
    async fn pending_filters_by_project() {
        let queue = queue_with_entry().await;
        assert_eq!(queue.pending(None).await.unwrap().len(), 1);
        assert_eq!(
            queue.pending(Some("myapp".into())).await.unwrap().len(),
            1
        );
        assert!(queue
            .pending(Some("other".into()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn claim_returns_captured_context() {
        let queue = queue_with_entry().await;
        let entry = queue.claim("a1", "a2").await.unwrap();
        assert_eq!(entry.state, ResurrectionState::Resurrecting);
        assert_eq!(entry.new_id.as_deref(), Some("a2"));
        assert_eq!(entry.purpose.as_deref(), Some("build the thing"));
        assert_eq!(entry.session_id.as_deref(), Some("s1"));
        assert_eq!(entry.notes.len(), 1);
        assert_eq!(entry.notes[0].content, "wip");

        // A second claim is a state error, not a silent steal.
        assert!(matches!(
            queue.claim("a1", "a3").await,
            Err(ResurrectionError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn full_state_machine() {
        let queue = queue_with_entry().await;
        queue.claim("a1", "a2").await.unwrap();
        let entry = queue.abandon("a1").await.unwrap();
        assert_eq!(entry.state, ResurrectionState::Pending);
        assert!(entry.new_id.is_none());

        queue.claim("a1", "a3").await.unwrap();
        let entry = queue.complete("a1").await.unwrap();
        assert_eq!(entry.state, ResurrectionState::Completed);

        assert!(matches!(
            queue.dismiss("a1").await,
            Err(ResurrectionError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn dismiss_from_pending() {
        let queue = queue_with_entry().await;
        let entry = queue.dismiss("a1").await.unwrap();
        assert_eq!(entry.state, ResurrectionState::Dismissed);
        assert!(queue.pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let queue = queue_with_entry().await;
        assert!(matches!(
            queue.claim("ghost", "a2").await,
            Err(ResurrectionError::NotFound(_))
        ));
    }
}
