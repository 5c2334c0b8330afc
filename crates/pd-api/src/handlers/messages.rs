//! `/msg/{channel}` — publish, cursor reads, long-poll, and the SSE
//! subscriber stream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use serde::Deserialize;

use pd_bus::{ConnKind, ConnectionGuard};
use pd_core::identity;
use pd_core::types::Message;

use super::{caller_agent, origin_of};
use crate::error::ApiError;
use crate::extract::Json;
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    pub payload: serde_json::Value,
    pub sender: Option<String>,
    pub expires_at: Option<i64>,
}

pub async fn publish(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> Result<Json<Message>, ApiError> {
    let sender = body.sender.or_else(|| caller_agent(&headers));
    let message = state
        .messages
        .publish(&channel, body.payload, sender, body.expires_at)
        .await?;
    Ok(Json(message))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub after: i64,
    pub limit: Option<i64>,
}

pub async fn read(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = state
        .messages
        .read(&channel, query.after, query.limit)
        .await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

pub async fn clear(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cleared = state.messages.clear(&channel).await?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

pub async fn channels(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channels = state.messages.channels().await?;
    Ok(Json(serde_json::json!({ "channels": channels })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub after: i64,
    /// Milliseconds; clamped to the configured maximum.
    pub timeout: Option<u64>,
}

/// Long-poll: returns as soon as a message lands, or with an empty list at
/// the (bounded) timeout. The connection-tracker slot is held for the whole
/// wait and released on any exit, including client disconnect.
pub async fn poll(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let origin = origin_of(&headers);
    let _guard = state.connections.try_open(&origin, ConnKind::LongPoll)?;

    let timeout = Duration::from_millis(
        query
            .timeout
            .unwrap_or(state.config.limits.poll_timeout_max_ms)
            .min(state.config.limits.poll_timeout_max_ms),
    );
    let messages = state.messages.poll(&channel, query.after, timeout).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

// ---------------------------------------------------------------------------
// SSE subscribe
// ---------------------------------------------------------------------------

/// Stream recheck interval, matching the long-poll cadence.
const STREAM_RECHECK: Duration = Duration::from_secs(1);

struct StreamState {
    state: Arc<ApiState>,
    channel: String,
    cursor: i64,
    deadline: tokio::time::Instant,
    buffered: VecDeque<Message>,
    phase: StreamPhase,
    _guard: ConnectionGuard,
}

enum StreamPhase {
    Connected,
    Live,
    Done,
}

/// Event-stream subscription: a `connected` event, then one `message` event
/// per published row, keep-alive comments every 30 s, and a final `timeout`
/// event at the stream's hard lifetime cap.
pub async fn subscribe(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ReadQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    identity::validate_name(&channel)
        .map_err(|_| ApiError::BadRequest(format!("invalid channel name: {channel}")))?;
    let origin = origin_of(&headers);
    let guard = state.connections.try_open(&origin, ConnKind::Stream)?;

    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(state.config.limits.stream_timeout_ms);
    let stream_state = StreamState {
        state,
        channel,
        cursor: query.after,
        deadline,
        buffered: VecDeque::new(),
        phase: StreamPhase::Connected,
        _guard: guard,
    };

    let stream = futures_util::stream::unfold(stream_state, |mut st| async move {
        match st.phase {
            StreamPhase::Connected => {
                st.phase = StreamPhase::Live;
                let event = Event::default().event("connected").data("{}");
                return Some((Ok(event), st));
            }
            StreamPhase::Done => return None,
            StreamPhase::Live => {}
        }
        loop {
            if let Some(message) = st.buffered.pop_front() {
                let data =
                    serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
                let event = Event::default().event("message").data(data);
                return Some((Ok(event), st));
            }
            match st.state.messages.read(&st.channel, st.cursor, None).await {
                Ok(rows) if !rows.is_empty() => {
                    st.cursor = rows.last().map(|m| m.id).unwrap_or(st.cursor);
                    st.buffered.extend(rows);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, channel = %st.channel, "subscriber read failed");
                    st.phase = StreamPhase::Done;
                    let event = Event::default().event("error").data("{}");
                    return Some((Ok(event), st));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= st.deadline {
                st.phase = StreamPhase::Done;
                let event = Event::default().event("timeout").data("{}");
                return Some((Ok(event), st));
            }
            tokio::time::sleep(STREAM_RECHECK.min(st.deadline - now)).await;
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    ))
}
