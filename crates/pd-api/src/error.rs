//! HTTP error mapping. Every failure crossing the API boundary becomes the
//! stable envelope `{error: "<message>", ...}` with the status from the
//! error taxonomy; internal faults stay opaque to the client and land in
//! the logs instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use pd_agents::{AgentError, ResurrectionError, SessionError};
use pd_bus::{ConnectionRefused, MessageError};
use pd_core::store::StoreError;
use pd_registry::{LockError, RegistryError};
use pd_webhook::WebhookError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// 409 with optional extra fields merged into the envelope.
    #[error("{message}")]
    Conflict {
        message: String,
        extra: serde_json::Value,
    },

    #[error("{0}")]
    Quota(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Timeout(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict {
            message: message.into(),
            extra: json!({}),
        }
    }

    pub fn conflict_with(message: impl Into<String>, extra: serde_json::Value) -> Self {
        ApiError::Conflict {
            message: message.into(),
            extra,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, extra) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, json!({})),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, json!({})),
            ApiError::Conflict { message, extra } => (StatusCode::CONFLICT, message, extra),
            ApiError::Quota(msg) => (StatusCode::TOO_MANY_REQUESTS, msg, json!({})),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, json!({})),
            ApiError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg, json!({})),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                    json!({}),
                )
            }
        };
        let mut body = json!({ "error": message });
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Domain error conversions
// ---------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidIdentity(_)
            | RegistryError::ReservedPort(_)
            | RegistryError::OutOfRangePort { .. }
            | RegistryError::BadRange(..)
            | RegistryError::InvalidUrl(_)
            | RegistryError::InvalidEnv(_)
            | RegistryError::EmptyRelease
            | RegistryError::NoFreePort { .. } => ApiError::BadRequest(e.to_string()),
            RegistryError::MetadataTooLarge(_) => ApiError::PayloadTooLarge(e.to_string()),
            RegistryError::QuotaExceeded { .. } => ApiError::Quota(e.to_string()),
            RegistryError::PortRace => ApiError::conflict(e.to_string()),
            RegistryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            RegistryError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::BadName(_) | LockError::BadTtl { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            LockError::Held { owner, expires_at } => ApiError::conflict_with(
                "lock held",
                json!({ "owner": owner, "expiresAt": expires_at }),
            ),
            LockError::QuotaExceeded { .. } => ApiError::Quota(e.to_string()),
            LockError::NotOwner { owner } => {
                ApiError::conflict_with("lock is owned by another owner", json!({"owner": owner}))
            }
            LockError::NotFound(_) => ApiError::NotFound(e.to_string()),
            LockError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MessageError> for ApiError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::BadChannel(_) => ApiError::BadRequest(e.to_string()),
            MessageError::PayloadTooLarge(_) => ApiError::PayloadTooLarge(e.to_string()),
            MessageError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::BadId(_) => ApiError::BadRequest(e.to_string()),
            AgentError::NotFound(_) => ApiError::NotFound(e.to_string()),
            AgentError::ResurrectionPending { .. } => {
                ApiError::conflict_with(e.to_string(), json!({"resurrectionPending": true}))
            }
            AgentError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::EmptyPurpose | SessionError::BadTransition { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            SessionError::NotFound(_) => ApiError::NotFound(e.to_string()),
            SessionError::ActiveSessionExists {
                ref session_id, ..
            } => {
                let session_id = session_id.clone();
                ApiError::conflict_with(e.to_string(), json!({"sessionId": session_id}))
            }
            SessionError::FileConflict { conflicts } => ApiError::conflict_with(
                "file claims conflict with active sessions",
                json!({
                    "conflicts": conflicts,
                    "hint": "pass force: true to claim anyway"
                }),
            ),
            SessionError::NotActive(_) => ApiError::conflict(e.to_string()),
            SessionError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ResurrectionError> for ApiError {
    fn from(e: ResurrectionError) -> Self {
        match e {
            ResurrectionError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ResurrectionError::WrongState { .. } => ApiError::conflict(e.to_string()),
            ResurrectionError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::InvalidUrl(_)
            | WebhookError::BlockedUrl(_)
            | WebhookError::InvalidFilter(_) => ApiError::BadRequest(e.to_string()),
            WebhookError::NotFound(_) => ApiError::NotFound(e.to_string()),
            WebhookError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ConnectionRefused> for ApiError {
    fn from(e: ConnectionRefused) -> Self {
        ApiError::Quota(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
