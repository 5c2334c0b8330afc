//! Domain types shared across the daemon. All timestamps are integer
//! milliseconds since the Unix epoch, UTC. Wire serialization is camelCase
//! to match the daemon's JSON surface.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Assigned,
    Running,
    Stopped,
    Crashed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Assigned => "assigned",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assigned" => Some(ServiceStatus::Assigned),
            "running" => Some(ServiceStatus::Running),
            "stopped" => Some(ServiceStatus::Stopped),
            "crashed" => Some(ServiceStatus::Crashed),
            _ => None,
        }
    }
}

/// A registered service: one semantic identity bound to at most one TCP port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    /// `None` for port-less workers.
    pub port: Option<u16>,
    pub pid: Option<i64>,
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub status: ServiceStatus,
    pub created_at: i64,
    pub last_seen: i64,
    pub expires_at: Option<i64>,
    pub restart_policy: Option<String>,
    pub health_url: Option<String>,
    pub tunnel_provider: Option<String>,
    pub tunnel_url: Option<String>,
    pub paired_with: Option<String>,
    pub agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A per-environment URL attached to a service (`(service_id, env)` key).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub service_id: String,
    pub env: String,
    pub url: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One row of a channel's append-only log. `id` is the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub payload: serde_json::Value,
    pub sender: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Per-channel summary returned by the channel listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel: String,
    pub count: i64,
    pub last_publish: i64,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// A named advisory lock. At most one live row exists per name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub name: String,
    pub owner: String,
    pub pid: Option<i64>,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Stale,
    Dead,
    Resurrecting,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Stale => "stale",
            AgentStatus::Dead => "dead",
            AgentStatus::Resurrecting => "resurrecting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "stale" => Some(AgentStatus::Stale),
            "dead" => Some(AgentStatus::Dead),
            "resurrecting" => Some(AgentStatus::Resurrecting),
            _ => None,
        }
    }
}

/// A client process registered with the daemon, subject to quotas and
/// heartbeat-based liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub pid: Option<i64>,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    pub max_services: i64,
    pub max_locks: i64,
    pub identity_project: Option<String>,
    pub identity_stack: Option<String>,
    pub identity_context: Option<String>,
    pub purpose: Option<String>,
    pub worktree_id: Option<String>,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectionState {
    Pending,
    Resurrecting,
    Completed,
    Dismissed,
}

impl ResurrectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectionState::Pending => "pending",
            ResurrectionState::Resurrecting => "resurrecting",
            ResurrectionState::Completed => "completed",
            ResurrectionState::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResurrectionState::Pending),
            "resurrecting" => Some(ResurrectionState::Resurrecting),
            "completed" => Some(ResurrectionState::Completed),
            "dismissed" => Some(ResurrectionState::Dismissed),
            _ => None,
        }
    }
}

/// Context captured from a dead agent, waiting for a successor to claim it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResurrectionEntry {
    pub old_id: String,
    pub new_id: Option<String>,
    pub project: Option<String>,
    pub purpose: Option<String>,
    pub session_id: Option<String>,
    /// Recent notes captured at the time of death.
    pub notes: Vec<SessionNote>,
    pub state: ResurrectionState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A directed message in an agent's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: i64,
    pub agent_id: String,
    pub content: String,
    pub sender: Option<String>,
    pub read: bool,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }
}

/// A mutable container for a unit of agent work; owns file claims and notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub purpose: String,
    pub status: SessionStatus,
    pub agent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// An advisory claim of one file path by one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileClaim {
    pub session_id: String,
    pub file_path: String,
    pub claimed_at: i64,
    pub released_at: Option<i64>,
}

/// An immutable note attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNote {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

/// An outbound webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    /// Event names, or `["*"]` for all.
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub filter: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub metadata: Option<serde_json::Value>,
}

/// One recorded delivery attempt chain for a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: i64,
    pub subscription_id: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    pub status_code: Option<i64>,
    pub success: bool,
    pub attempts: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// The audit-log action vocabulary. Stored as the dotted string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    #[serde(rename = "service.claim")]
    ServiceClaim,
    #[serde(rename = "service.release")]
    ServiceRelease,
    #[serde(rename = "lock.acquire")]
    LockAcquire,
    #[serde(rename = "lock.release")]
    LockRelease,
    #[serde(rename = "message.publish")]
    MessagePublish,
    #[serde(rename = "agent.register")]
    AgentRegister,
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat,
    #[serde(rename = "agent.unregister")]
    AgentUnregister,
    #[serde(rename = "agent.cleanup")]
    AgentCleanup,
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.update")]
    SessionUpdate,
    #[serde(rename = "session.delete")]
    SessionDelete,
    #[serde(rename = "webhook.delivery")]
    WebhookDelivery,
    #[serde(rename = "daemon.start")]
    DaemonStart,
    #[serde(rename = "daemon.stop")]
    DaemonStop,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ServiceClaim => "service.claim",
            ActivityKind::ServiceRelease => "service.release",
            ActivityKind::LockAcquire => "lock.acquire",
            ActivityKind::LockRelease => "lock.release",
            ActivityKind::MessagePublish => "message.publish",
            ActivityKind::AgentRegister => "agent.register",
            ActivityKind::AgentHeartbeat => "agent.heartbeat",
            ActivityKind::AgentUnregister => "agent.unregister",
            ActivityKind::AgentCleanup => "agent.cleanup",
            ActivityKind::SessionStart => "session.start",
            ActivityKind::SessionUpdate => "session.update",
            ActivityKind::SessionDelete => "session.delete",
            ActivityKind::WebhookDelivery => "webhook.delivery",
            ActivityKind::DaemonStart => "daemon.start",
            ActivityKind::DaemonStop => "daemon.stop",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: i64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub agent_id: Option<String>,
    pub target_id: Option<String>,
    pub details: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Projects (opaque key/value storage for the external scanner)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub root: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub config: Option<serde_json::Value>,
    pub services: Option<serde_json::Value>,
    pub last_scanned: Option<i64>,
    pub created_at: i64,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in ["assigned", "running", "stopped", "crashed"] {
            assert_eq!(ServiceStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ServiceStatus::parse("bogus").is_none());
    }

    #[test]
    fn activity_kind_serializes_dotted() {
        let json = serde_json::to_string(&ActivityKind::ServiceClaim).unwrap();
        assert_eq!(json, "\"service.claim\"");
        let back: ActivityKind = serde_json::from_str("\"daemon.stop\"").unwrap();
        assert_eq!(back, ActivityKind::DaemonStop);
    }

    #[test]
    fn wire_form_is_camel_case() {
        let lock = Lock {
            name: "build".into(),
            owner: "agent-1".into(),
            pid: None,
            acquired_at: 1,
            expires_at: 2,
            metadata: None,
        };
        let json = serde_json::to_value(&lock).unwrap();
        assert!(json.get("acquiredAt").is_some());
        assert!(json.get("expiresAt").is_some());
    }
}
