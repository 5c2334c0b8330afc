//! OS-level observation: process liveness and system TCP-listener
//! enumeration. The daemon's database describes intent; this crate reports
//! reality so the claim path can reconcile the two.

mod listeners;
mod process;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

pub use listeners::parse_lsof_output;

/// How long an enumeration snapshot stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(10);
/// Hard timeout on the enumeration subprocess.
const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard timeout on a single-port connect probe.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Output cap for the enumeration subprocess.
const OUTPUT_CAP: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("listener enumeration failed: {0}")]
    Enumerate(String),
}

/// One OS-level TCP listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemListener {
    pub port: u16,
    pub pid: Option<i64>,
    pub command: Option<String>,
    pub user: Option<String>,
}

/// Observation seam injected into the registry and the reaper.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Is the process alive? Any failure to determine counts as "no".
    async fn pid_alive(&self, pid: i64) -> bool;

    /// Sorted, deduplicated system listener snapshot (cached).
    async fn listeners(&self) -> Result<Vec<SystemListener>, ProbeError>;

    /// Direct check of one port, bypassing the snapshot cache.
    async fn port_in_use(&self, port: u16) -> bool;
}

// ---------------------------------------------------------------------------
// OsProbe
// ---------------------------------------------------------------------------

struct CachedSnapshot {
    fetched_at: Instant,
    listeners: Vec<SystemListener>,
}

/// The real probe. Spawns the platform's socket-enumeration tool and caches
/// the parsed snapshot so the common claim path stays fast. The cache mutex
/// doubles as a singleflight: concurrent refreshers queue behind one spawn.
pub struct OsProbe {
    cache: Mutex<Option<CachedSnapshot>>,
}

impl OsProbe {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl Default for OsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for OsProbe {
    async fn pid_alive(&self, pid: i64) -> bool {
        process::pid_alive(pid).await
    }

    async fn listeners(&self) -> Result<Vec<SystemListener>, ProbeError> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = cache.as_ref() {
            if snapshot.fetched_at.elapsed() < CACHE_TTL {
                return Ok(snapshot.listeners.clone());
            }
        }

        match listeners::enumerate(ENUMERATE_TIMEOUT, OUTPUT_CAP).await {
            Ok(listeners) => {
                *cache = Some(CachedSnapshot {
                    fetched_at: Instant::now(),
                    listeners: listeners.clone(),
                });
                Ok(listeners)
            }
            Err(e) => {
                // Serve the stale snapshot rather than fail the claim path.
                if let Some(snapshot) = cache.as_ref() {
                    warn!(error = %e, "listener enumeration failed, serving stale snapshot");
                    return Ok(snapshot.listeners.clone());
                }
                Err(e)
            }
        }
    }

    async fn port_in_use(&self, port: u16) -> bool {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        matches!(
            tokio::time::timeout(PORT_PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

// ---------------------------------------------------------------------------
// StaticProbe — test double
// ---------------------------------------------------------------------------

/// A probe with fixed answers, for tests.
#[derive(Debug, Default)]
pub struct StaticProbe {
    pub alive_pids: std::sync::Mutex<std::collections::HashSet<i64>>,
    pub bound_ports: std::sync::Mutex<std::collections::HashSet<u16>>,
}

impl StaticProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_alive(&self, pid: i64, alive: bool) {
        let mut pids = self.alive_pids.lock().expect("probe lock");
        if alive {
            pids.insert(pid);
        } else {
            pids.remove(&pid);
        }
    }

    pub fn bind_port(&self, port: u16) {
        self.bound_ports.lock().expect("probe lock").insert(port);
    }

    pub fn release_port(&self, port: u16) {
        self.bound_ports.lock().expect("probe lock").remove(&port);
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn pid_alive(&self, pid: i64) -> bool {
        self.alive_pids.lock().expect("probe lock").contains(&pid)
    }

    async fn listeners(&self) -> Result<Vec<SystemListener>, ProbeError> {
        let mut out: Vec<SystemListener> = self
            .bound_ports
            .lock()
            .expect("probe lock")
            .iter()
            .map(|&port| SystemListener {
                port,
                pid: None,
                command: None,
                user: None,
            })
            .collect();
        out.sort_by_key(|l| l.port);
        Ok(out)
    }

    async fn port_in_use(&self, port: u16) -> bool {
        self.bound_ports.lock().expect("probe lock").contains(&port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
