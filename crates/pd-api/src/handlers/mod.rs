//! Request handlers, one module per domain. Each validates inputs, calls
//! one core component, and relies on `ApiError` for status mapping.

pub mod activity;
pub mod agents;
pub mod locks;
pub mod messages;
pub mod misc;
pub mod services;
pub mod sessions;
pub mod webhooks;

use axum::http::HeaderMap;

/// Caller pid from the `X-PID` header.
pub(crate) fn caller_pid(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("x-pid")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Caller agent id from the `X-Agent-Id` header.
pub(crate) fn caller_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Connection-tracker origin: the `Origin` header when present (dashboard
/// traffic), otherwise the caller's agent or pid, otherwise a shared bucket.
pub(crate) fn origin_of(headers: &HeaderMap) -> String {
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        return origin.to_string();
    }
    if let Some(agent) = caller_agent(headers) {
        return format!("agent:{agent}");
    }
    if let Some(pid) = caller_pid(headers) {
        return format!("pid:{pid}");
    }
    "local".to_string()
}
