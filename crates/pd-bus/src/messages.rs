//! The append-only channel message log. `id` is assigned by the database
//! and strictly increases, so readers resume from any cursor with
//! `id > after_id` and observe publish order.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use pd_core::clock::Clock;
use pd_core::identity;
use pd_core::store::{Store, StoreError};
use pd_core::types::{ChannelInfo, Message};

use crate::events::{DaemonEvent, EventBus};

/// Interval between long-poll rechecks.
const POLL_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid channel name: {0}")]
    BadChannel(String),

    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct MessageLog {
    store: Store,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    /// Max rows kept per channel; publishing past it trims oldest-first.
    channel_cap: i64,
    /// Hard cap on rows returned by one read.
    read_max: i64,
    payload_max_bytes: usize,
}

impl MessageLog {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        channel_cap: i64,
        read_max: i64,
        payload_max_bytes: usize,
    ) -> Self {
        Self {
            store,
            clock,
            bus,
            channel_cap,
            read_max,
            payload_max_bytes,
        }
    }

    /// Append one message and return the stored row (with its assigned id).
    pub async fn publish(
        &self,
        channel: &str,
        payload: serde_json::Value,
        sender: Option<String>,
        expires_at: Option<i64>,
    ) -> Result<Message, MessageError> {
        identity::validate_name(channel)
            .map_err(|_| MessageError::BadChannel(channel.to_string()))?;
        let raw = payload.to_string();
        if raw.len() > self.payload_max_bytes {
            return Err(MessageError::PayloadTooLarge(self.payload_max_bytes));
        }

        let now = self.clock.now_ms();
        let channel_owned = channel.to_string();
        let cap = self.channel_cap;
        let sender_col = sender.clone();
        let id = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO messages (channel, payload, sender, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![channel_owned, raw, sender_col, now, expires_at],
                )?;
                let id = tx.last_insert_rowid();
                // Enforce the per-channel depth cap, oldest rows first.
                tx.execute(
                    "DELETE FROM messages WHERE channel = ?1 AND id IN (
                         SELECT id FROM messages WHERE channel = ?1
                         ORDER BY id DESC LIMIT -1 OFFSET ?2
                     )",
                    rusqlite::params![channel_owned, cap],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;

        let message = Message {
            id,
            channel: channel.to_string(),
            payload,
            sender,
            created_at: now,
            expires_at,
        };
        self.bus.publish(DaemonEvent::new(
            "message.publish",
            Some(channel.to_string()),
            now,
            serde_json::json!({"id": id, "channel": channel}),
        ));
        debug!(channel, id, "message published");
        Ok(message)
    }

    /// Rows with `id > after_id`, ascending, capped at
    /// `min(limit, read_max)`. Expired rows are skipped.
    pub async fn read(
        &self,
        channel: &str,
        after_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, MessageError> {
        let limit = limit.unwrap_or(self.read_max).clamp(1, self.read_max);
        let channel = channel.to_string();
        let now = self.clock.now_ms();
        let rows = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, channel, payload, sender, created_at, expires_at
                     FROM messages
                     WHERE channel = ?1 AND id > ?2
                       AND (expires_at IS NULL OR expires_at > ?3)
                     ORDER BY id ASC LIMIT ?4",
                )?;
                let mut rows = stmt.query(rusqlite::params![channel, after_id, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Long-poll: immediate read, then periodic rechecks until a row shows
    /// up or the timeout elapses. Returns an empty vec on timeout. The
    /// caller's cancellation (client disconnect) simply drops the future.
    pub async fn poll(
        &self,
        channel: &str,
        after_id: i64,
        timeout: Duration,
    ) -> Result<Vec<Message>, MessageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let rows = self.read(channel, after_id, None).await?;
            if !rows.is_empty() {
                return Ok(rows);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_RECHECK.min(deadline - now)).await;
        }
    }

    /// All channels holding at least one row.
    pub async fn channels(&self) -> Result<Vec<ChannelInfo>, StoreError> {
        self.store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT channel, COUNT(*), MAX(created_at)
                     FROM messages GROUP BY channel ORDER BY channel",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(ChannelInfo {
                        channel: row.get(0)?,
                        count: row.get(1)?,
                        last_publish: row.get(2)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Delete all rows for a channel. Returns the count removed.
    pub async fn clear(&self, channel: &str) -> Result<usize, StoreError> {
        let channel = channel.to_string();
        self.store
            .call(move |conn| conn.execute("DELETE FROM messages WHERE channel = ?1", [channel]))
            .await
    }

    /// Reaper hook: drop expired rows, then re-enforce the channel cap
    /// across all channels. Returns total rows removed.
    pub async fn trim(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let cap = self.channel_cap;
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut removed = tx.execute(
                    "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    [now],
                )?;
                let channels: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT channel FROM messages GROUP BY channel HAVING COUNT(*) > ?1",
                    )?;
                    let mut rows = stmt.query([cap])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row.get(0)?);
                    }
                    out
                };
                for channel in channels {
                    removed += tx.execute(
                        "DELETE FROM messages WHERE channel = ?1 AND id IN (
                             SELECT id FROM messages WHERE channel = ?1
                             ORDER BY id DESC LIMIT -1 OFFSET ?2
                         )",
                        rusqlite::params![channel, cap],
                    )?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let raw: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        channel: row.get(1)?,
        payload: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
        sender: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
