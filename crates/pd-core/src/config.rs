//! Daemon configuration: a single JSON document (`port-daddy.json`) with
//! per-field defaults so a partial file works, plus `PORT_DADDY_*`
//! environment overrides applied after load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub webhooks: WebhookPipelineConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load from `<root>/port-daddy.json` when present, otherwise defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = root.as_ref().join("port-daddy.json");
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific path (no env overrides).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Apply `PORT_DADDY_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("PORT_DADDY_DB") {
            if !db.is_empty() {
                self.database.path = db;
            }
        }
        if let Ok(port) = std::env::var("PORT_DADDY_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.service.tcp_port = port;
            }
        }
        if let Ok(sock) = std::env::var("PORT_DADDY_SOCK") {
            if !sock.is_empty() {
                self.service.socket_path = sock;
            }
        }
        if std::env::var("PORT_DADDY_NO_TCP").is_ok_and(|v| v != "0" && !v.is_empty()) {
            self.service.tcp_enabled = false;
        }
        if std::env::var("PORT_DADDY_SILENT").is_ok_and(|v| v != "0" && !v.is_empty()) {
            self.logging.silent = true;
        }
    }

    /// Expand a leading `~/` in the database path against `$HOME`.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database.path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_true")]
    pub tcp_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            socket_path: default_socket_path(),
            tcp_enabled: true,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_tcp_port() -> u16 {
    9876
}
fn default_socket_path() -> String {
    "/tmp/port-daddy.sock".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.port-daddy/daemon.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
    /// Ports never assigned even when inside the range.
    #[serde(default)]
    pub reserved: Vec<u16>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            reserved: Vec::new(),
        }
    }
}

fn default_range_start() -> u16 {
    3000
}
fn default_range_end() -> u16 {
    3999
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Reaper interval.
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,
    /// Heartbeat age after which an agent is stale.
    #[serde(default = "default_agent_stale_ms")]
    pub agent_stale_ms: i64,
    /// Heartbeat age after which a stale agent is dead even with an unknown pid.
    #[serde(default = "default_agent_dead_ms")]
    pub agent_dead_ms: i64,
    #[serde(default = "default_activity_retention_ms")]
    pub activity_retention_ms: i64,
    #[serde(default = "default_activity_max_rows")]
    pub activity_max_rows: i64,
    /// Max rows kept per message channel.
    #[serde(default = "default_channel_cap")]
    pub message_channel_cap: i64,
    /// Retention of notes on completed/abandoned sessions.
    #[serde(default = "default_note_retention_ms")]
    pub note_retention_ms: i64,
    #[serde(default = "default_delivery_retention_ms")]
    pub delivery_retention_ms: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_cleanup_interval_ms(),
            agent_stale_ms: default_agent_stale_ms(),
            agent_dead_ms: default_agent_dead_ms(),
            activity_retention_ms: default_activity_retention_ms(),
            activity_max_rows: default_activity_max_rows(),
            message_channel_cap: default_channel_cap(),
            note_retention_ms: default_note_retention_ms(),
            delivery_retention_ms: default_delivery_retention_ms(),
        }
    }
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}
fn default_agent_stale_ms() -> i64 {
    5 * 60 * 1000
}
fn default_agent_dead_ms() -> i64 {
    15 * 60 * 1000
}
fn default_activity_retention_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}
fn default_activity_max_rows() -> i64 {
    10_000
}
fn default_channel_cap() -> i64 {
    1_000
}
fn default_note_retention_ms() -> i64 {
    30 * 24 * 60 * 60 * 1000
}
fn default_delivery_retention_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Request body cap for control endpoints.
    #[serde(default = "default_body_max")]
    pub body_max_bytes: usize,
    /// Cap on service/lock/webhook metadata blobs.
    #[serde(default = "default_metadata_max")]
    pub metadata_max_bytes: usize,
    /// Cap on a single message payload.
    #[serde(default = "default_payload_max")]
    pub payload_max_bytes: usize,
    #[serde(default = "default_poll_timeout_max_ms")]
    pub poll_timeout_max_ms: u64,
    /// Hard cap on a subscriber stream's lifetime.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default = "default_long_poll_max")]
    pub long_poll_max: usize,
    #[serde(default = "default_stream_max")]
    pub stream_max: usize,
    #[serde(default = "default_per_origin_max")]
    pub per_origin_max: usize,
    #[serde(default = "default_max_lock_ttl_ms")]
    pub max_lock_ttl_ms: i64,
    /// Hard cap on rows per message read.
    #[serde(default = "default_message_read_max")]
    pub message_read_max: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            body_max_bytes: default_body_max(),
            metadata_max_bytes: default_metadata_max(),
            payload_max_bytes: default_payload_max(),
            poll_timeout_max_ms: default_poll_timeout_max_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            long_poll_max: default_long_poll_max(),
            stream_max: default_stream_max(),
            per_origin_max: default_per_origin_max(),
            max_lock_ttl_ms: default_max_lock_ttl_ms(),
            message_read_max: default_message_read_max(),
        }
    }
}

fn default_body_max() -> usize {
    10 * 1024
}
fn default_metadata_max() -> usize {
    10 * 1024
}
fn default_payload_max() -> usize {
    64 * 1024
}
fn default_poll_timeout_max_ms() -> u64 {
    60_000
}
fn default_stream_timeout_ms() -> u64 {
    5 * 60 * 1000
}
fn default_long_poll_max() -> usize {
    50
}
fn default_stream_max() -> usize {
    100
}
fn default_per_origin_max() -> usize {
    5
}
fn default_max_lock_ttl_ms() -> i64 {
    30 * 24 * 60 * 60 * 1000
}
fn default_message_read_max() -> i64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Disables non-error logging when set.
    #[serde(default)]
    pub silent: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            silent: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Per-origin request budget per minute. `/health` and `/version` are exempt.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

fn default_rate_limit() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPipelineConfig {
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_backoff_base_ms")]
    pub backoff_base_ms: i64,
    #[serde(default = "default_webhook_backoff_max_ms")]
    pub backoff_max_ms: i64,
}

impl Default for WebhookPipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_max_attempts(),
            timeout_ms: default_webhook_timeout_ms(),
            backoff_base_ms: default_webhook_backoff_base_ms(),
            backoff_max_ms: default_webhook_backoff_max_ms(),
        }
    }
}

fn default_webhook_max_attempts() -> i64 {
    5
}
fn default_webhook_timeout_ms() -> u64 {
    5_000
}
fn default_webhook_backoff_base_ms() -> i64 {
    1_000
}
fn default_webhook_backoff_max_ms() -> i64 {
    5 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_max_services")]
    pub default_max_services: i64,
    #[serde(default = "default_max_locks")]
    pub default_max_locks: i64,
    /// Enforce a single active session per agent.
    #[serde(default = "default_true")]
    pub single_active_session: bool,
    /// Heartbeat from an unknown agent with a pending resurrection entry
    /// re-registers it when set; otherwise the heartbeat is rejected.
    #[serde(default)]
    pub auto_revive_on_heartbeat: bool,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_max_services: default_max_services(),
            default_max_locks: default_max_locks(),
            single_active_session: true,
            auto_revive_on_heartbeat: false,
        }
    }
}

fn default_max_services() -> i64 {
    10
}
fn default_max_locks() -> i64 {
    10
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
