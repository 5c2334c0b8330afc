//! Per-agent inboxes: directed messages routed by recipient agent id,
//! separate from the open channel bus.

use std::sync::Arc;

use serde::Serialize;

use pd_core::clock::Clock;
use pd_core::store::{Store, StoreError};
use pd_core::types::InboxMessage;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxStats {
    pub total: i64,
    pub unread: i64,
}

#[derive(Clone)]
pub struct Inbox {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl Inbox {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn post(
        &self,
        agent_id: &str,
        content: &str,
        sender: Option<String>,
    ) -> Result<InboxMessage, StoreError> {
        let now = self.clock.now_ms();
        let agent = agent_id.to_string();
        let content_owned = content.to_string();
        let sender_col = sender.clone();
        let id = self
            .store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_inbox (agent_id, content, sender, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![agent, content_owned, sender_col, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(InboxMessage {
            id,
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            sender,
            read: false,
            created_at: now,
        })
    }

    /// Oldest first, optionally unread only.
    pub async fn list(
        &self,
        agent_id: &str,
        unread_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let agent = agent_id.to_string();
        let limit = limit.unwrap_or(100).clamp(1, 1000);
        self.store
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT id, agent_id, content, sender, read, created_at
                     FROM agent_inbox WHERE agent_id = ?1",
                );
                if unread_only {
                    sql.push_str(" AND read = 0");
                }
                sql.push_str(" ORDER BY id ASC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![agent, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(InboxMessage {
                        id: row.get(0)?,
                        agent_id: row.get(1)?,
                        content: row.get(2)?,
                        sender: row.get(3)?,
                        read: row.get::<_, i64>(4)? != 0,
                        created_at: row.get(5)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn mark_all_read(&self, agent_id: &str) -> Result<usize, StoreError> {
        let agent = agent_id.to_string();
        self.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_inbox SET read = 1 WHERE agent_id = ?1 AND read = 0",
                    [agent],
                )
            })
            .await
    }

    pub async fn clear(&self, agent_id: &str) -> Result<usize, StoreError> {
        let agent = agent_id.to_string();
        self.store
            .call(move |conn| conn.execute("DELETE FROM agent_inbox WHERE agent_id = ?1", [agent]))
            .await
    }

    pub async fn stats(&self, agent_id: &str) -> Result<InboxStats, StoreError> {
        let agent = agent_id.to_string();
        self.store
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(read = 0), 0)
                     FROM agent_inbox WHERE agent_id = ?1",
                    [agent],
                    |r| {
                        Ok(InboxStats {
                            total: r.get(0)?,
                            unread: r.get(1)?,
                        })
                    },
                )
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::clock::ManualClock;

    async fn inbox() -> Inbox {
        let store = Store::open_in_memory().await.unwrap();
        Inbox::new(store, Arc::new(ManualClock::at(1_000)))
    }

    #[tokio::test]
    async fn post_list_read_clear_cycle() {
        let inbox = inbox().await;
        inbox.post("a1", "hello", Some("a2".into())).await.unwrap();
        inbox.post("a1", "world", None).await.unwrap();
        inbox.post("b1", "other inbox", None).await.unwrap();

        let all = inbox.list("a1", false, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "hello");
        assert_eq!(all[0].sender.as_deref(), Some("a2"));

        let stats = inbox.stats("a1").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unread, 2);

        assert_eq!(inbox.mark_all_read("a1").await.unwrap(), 2);
        assert!(inbox.list("a1", true, None).await.unwrap().is_empty());
        let stats = inbox.stats("a1").await.unwrap();
        assert_eq!(stats.unread, 0);

        assert_eq!(inbox.clear("a1").await.unwrap(), 2);
        assert_eq!(inbox.stats("a1").await.unwrap().total, 0);
        // Other inboxes untouched.
        assert_eq!(inbox.stats("b1").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn unread_filter_and_limit() {
        let inbox = inbox().await;
        for i in 0..5 {
            inbox.post("a1", &format!("msg {i}"), None).await.unwrap();
        }
        inbox.mark_all_read("a1").await.unwrap();
        inbox.post("a1", "fresh", None).await.unwrap();

        let unread = inbox.list("a1", true, None).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].content, "fresh");

        let limited = inbox.list("a1", false, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
