//! Append-only audit log. Every state-changing core operation records one
//! row; queries serve the `/activity` surface and the reaper trims by
//! retention window and row cap.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::{json_column, json_param, Store, StoreError};
use crate::types::{ActivityEntry, ActivityKind};

/// Filters accepted by the recent-activity query.
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
    pub kind: Option<String>,
    pub agent_id: Option<String>,
    /// `LIKE` pattern against `target_id` (already translated).
    pub target_like: Option<String>,
}

/// Count per activity type over a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: i64,
}

/// Aggregate counts and extremes over the whole table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total: i64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub by_type: Vec<ActivitySummary>,
}

#[derive(Clone)]
pub struct ActivityLog {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append one audit row.
    pub async fn record(
        &self,
        kind: ActivityKind,
        agent_id: Option<String>,
        target_id: Option<String>,
        details: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity (timestamp, type, agent_id, target_id, details, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        now,
                        kind.as_str(),
                        agent_id,
                        target_id,
                        details,
                        json_param(&metadata),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent rows, newest first, with optional filters.
    pub async fn recent(&self, query: ActivityQuery) -> Result<Vec<ActivityEntry>, StoreError> {
        let limit = query.limit.unwrap_or(50).clamp(1, 1000);
        self.store
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT id, timestamp, type, agent_id, target_id, details, metadata
                     FROM activity WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(kind) = query.kind {
                    sql.push_str(" AND type = ?");
                    params.push(Box::new(kind));
                }
                if let Some(agent) = query.agent_id {
                    sql.push_str(" AND agent_id = ?");
                    params.push(Box::new(agent));
                }
                if let Some(target) = query.target_like {
                    sql.push_str(" AND target_id LIKE ? ESCAPE '\\'");
                    params.push(Box::new(target));
                }
                sql.push_str(" ORDER BY id DESC LIMIT ?");
                params.push(Box::new(limit));

                let mut stmt = conn.prepare(&sql)?;
                let refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Rows with `from <= timestamp < to`, oldest first.
    pub async fn range(&self, from: i64, to: i64) -> Result<Vec<ActivityEntry>, StoreError> {
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, type, agent_id, target_id, details, metadata
                     FROM activity WHERE timestamp >= ?1 AND timestamp < ?2
                     ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![from, to])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Group-by-type counts since `since` (0 for all time).
    pub async fn summary(&self, since: i64) -> Result<Vec<ActivitySummary>, StoreError> {
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT type, COUNT(*) FROM activity WHERE timestamp >= ?1
                     GROUP BY type ORDER BY COUNT(*) DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(ActivitySummary {
                        kind: row.get(0)?,
                        count: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn stats(&self) -> Result<ActivityStats, StoreError> {
        let by_type = self.summary(0).await?;
        let (total, oldest, newest) = self
            .store
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM activity",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
            })
            .await?;
        Ok(ActivityStats {
            total,
            oldest,
            newest,
            by_type,
        })
    }

    /// Delete rows older than the retention window, then enforce the row
    /// cap oldest-first. Returns the number of rows removed.
    pub async fn trim(&self, retention_ms: i64, max_rows: i64) -> Result<usize, StoreError> {
        let cutoff = self.clock.now_ms() - retention_ms;
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut removed =
                    tx.execute("DELETE FROM activity WHERE timestamp < ?1", [cutoff])?;
                removed += tx.execute(
                    "DELETE FROM activity WHERE id IN (
                         SELECT id FROM activity ORDER BY id DESC LIMIT -1 OFFSET ?1
                     )",
                    [max_rows],
                )?;
                tx.commit()?;
                Ok(removed)
            })
            .await
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEntry> {
    Ok(ActivityEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        kind: row.get(2)?,
        agent_id: row.get(3)?,
        target_id: row.get(4)?,
        details: row.get(5)?,
        metadata: json_column(row, 6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn log_at(now: i64) -> (ActivityLog, Arc<ManualClock>) {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::at(now));
        (ActivityLog::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn record_and_recent() {
        let (log, _clock) = log_at(1_000).await;
        log.record(
            ActivityKind::ServiceClaim,
            Some("a1".into()),
            Some("myapp:api".into()),
            Some("port 3100".into()),
            None,
        )
        .await
        .unwrap();
        log.record(ActivityKind::LockAcquire, None, Some("build".into()), None, None)
            .await
            .unwrap();

        let recent = log.recent(ActivityQuery::default()).await.unwrap();
        assert_eq!(recent.len(), 2);
        // newest first
        assert_eq!(recent[0].kind, "lock.acquire");

        let filtered = log
            .recent(ActivityQuery {
                kind: Some("service.claim".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].target_id.as_deref(), Some("myapp:api"));
    }

    #[tokio::test]
    async fn range_and_summary() {
        let (log, clock) = log_at(1_000).await;
        log.record(ActivityKind::ServiceClaim, None, None, None, None)
            .await
            .unwrap();
        clock.advance(100);
        log.record(ActivityKind::ServiceClaim, None, None, None, None)
            .await
            .unwrap();
        clock.advance(100);
        log.record(ActivityKind::ServiceRelease, None, None, None, None)
            .await
            .unwrap();

        let rows = log.range(1_050, 1_150).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 1_100);

        let summary = log.summary(0).await.unwrap();
        assert_eq!(summary[0].kind, "service.claim");
        assert_eq!(summary[0].count, 2);
    }

    #[tokio::test]
    async fn trim_honors_retention_and_cap() {
        let (log, clock) = log_at(0).await;
        for _ in 0..5 {
            log.record(ActivityKind::MessagePublish, None, None, None, None)
                .await
                .unwrap();
            clock.advance(10);
        }
        // retention removes rows older than now-25 (timestamps 0,10,20)
        let removed = log.trim(25, 100).await.unwrap();
        assert_eq!(removed, 3);

        // cap of 1 keeps only the newest remaining row
        let removed = log.trim(1_000_000, 1).await.unwrap();
        assert_eq!(removed, 1);
        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
