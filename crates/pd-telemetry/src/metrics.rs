//! The `/metrics` diagnostics snapshot: row counts per table, connection
//! totals, webhook queue depth, and reaper progress.

use serde::Serialize;

use pd_core::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TableCounts {
    pub services: i64,
    pub locks: i64,
    pub messages: i64,
    pub agents: i64,
    pub sessions: i64,
    pub session_notes: i64,
    pub webhooks: i64,
    pub webhook_deliveries: i64,
    pub activity: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub tables: TableCounts,
    pub long_poll_connections: usize,
    pub stream_connections: usize,
    pub webhook_queue_depth: usize,
    pub reaper_passes: u64,
    pub last_reaper_pass_at: Option<i64>,
}

/// Count rows in every daemon table.
pub async fn table_counts(store: &Store) -> Result<TableCounts, StoreError> {
    store
        .call(|conn| {
            let count = |table: &str| -> rusqlite::Result<i64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            };
            Ok(TableCounts {
                services: count("services")?,
                locks: count("locks")?,
                messages: count("messages")?,
                agents: count("agents")?,
                sessions: count("sessions")?,
                session_notes: count("session_notes")?,
                webhooks: count("webhooks")?,
                webhook_deliveries: count("webhook_deliveries")?,
                activity: count("activity")?,
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_follow_inserts() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .call(|conn| {
                conn.execute_batch(
                    "INSERT INTO services (id, port, status, created_at, last_seen)
                         VALUES ('a', 3100, 'assigned', 1, 1);
                     INSERT INTO locks (name, owner, acquired_at, expires_at)
                         VALUES ('l', 'o', 1, 2);
                     INSERT INTO messages (channel, payload, created_at)
                         VALUES ('ch', '{}', 1);",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let counts = table_counts(&store).await.unwrap();
        assert_eq!(counts.services, 1);
        assert_eq!(counts.locks, 1);
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.agents, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = MetricsSnapshot::default();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("uptimeSeconds").is_some());
        assert!(json.get("webhookQueueDepth").is_some());
    }
}
