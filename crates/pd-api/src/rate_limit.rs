//! Token-bucket rate limiting keyed per caller. The key is derived from the
//! first of `body.project`, `body.id`, or the `X-PID` header so distinct
//! identities on one machine do not starve each other. `/health` and
//! `/version` are exempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use crate::error::ApiError;
use crate::state::ApiState;

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens_per_second: f64, max_burst: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - self.tokens) / tokens_per_second,
            ))
        }
    }
}

/// Per-key buckets refilled continuously.
#[derive(Debug)]
pub struct RateLimiter {
    tokens_per_second: f64,
    max_burst: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn per_minute(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
            buckets: DashMap::new(),
        }
    }

    /// Check one request for `key`; `Err` carries the retry-after duration.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_burst));
        bucket.try_consume(self.tokens_per_second, self.max_burst)
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Buffer the body (enforcing the control-endpoint cap), derive the rate
/// key, check the bucket, and pass the request on with its body restored.
pub async fn rate_limit_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" || path == "/version" {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    // Control endpoints get the small cap; message publishes may carry a
    // payload up to the message cap plus envelope room.
    let cap = if path.starts_with("/msg/") {
        state.config.limits.payload_max_bytes + 4 * 1024
    } else {
        state.config.limits.body_max_bytes
    };
    let bytes = match axum::body::to_bytes(body, cap).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::PayloadTooLarge(format!("request body exceeds {cap} bytes"))
                .into_response();
        }
    };

    let key = derive_key(&parts.headers, &bytes);
    if let Err(retry_after) = state.rate_limiter.check(&key) {
        warn!(key, ?retry_after, "rate limit exceeded");
        let mut response =
            ApiError::Quota(format!("rate limit exceeded, retry in {retry_after:?}"))
                .into_response();
        if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
        return response;
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

/// First of `body.project`, `body.id`, `X-PID`, then a shared fallback.
fn derive_key(headers: &axum::http::HeaderMap, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["project", "id"] {
            if let Some(key) = value.get(field).and_then(|v| v.as_str()) {
                return key.to_string();
            }
        }
    }
    headers
        .get("x-pid")
        .and_then(|v| v.to_str().ok())
        .map(|pid| format!("pid:{pid}"))
        .unwrap_or_else(|| "anonymous".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_and_refills() {
        let limiter = RateLimiter::per_minute(60); // 1 token/sec
        for _ in 0..60 {
            limiter.check("a").expect("burst allowance");
        }
        let retry = limiter.check("a").expect_err("exhausted");
        assert!(retry <= Duration::from_secs(1));
        // Distinct keys have their own buckets.
        limiter.check("b").expect("fresh key");
    }

    #[test]
    fn key_derivation_prefers_body_fields() {
        let headers = axum::http::HeaderMap::new();
        assert_eq!(
            derive_key(&headers, br#"{"project": "myapp", "id": "x"}"#),
            "myapp"
        );
        assert_eq!(derive_key(&headers, br#"{"id": "myapp:api"}"#), "myapp:api");

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-pid", "4242".parse().unwrap());
        assert_eq!(derive_key(&headers, b"not json"), "pid:4242");

        let headers = axum::http::HeaderMap::new();
        assert_eq!(derive_key(&headers, b""), "anonymous");
    }
}
