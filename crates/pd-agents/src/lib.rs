//! Agent liveness and work-session tracking: the agent registry with
//! heartbeat-driven staleness, the resurrection queue that hands a dead
//! agent's context to its successor, per-agent inboxes, and structured
//! sessions with file claims and append-only notes.

pub mod inbox;
pub mod registry;
pub mod resurrection;
pub mod sessions;

pub use inbox::{Inbox, InboxStats};
pub use registry::{
    AgentError, AgentRegistry, CleanupOutcome, RegisterIdentity, RegisterOutcome,
    RegisterRequest, SalvageHint,
};
pub use resurrection::{ResurrectionError, ResurrectionQueue};
pub use sessions::{SessionError, SessionManager, StartSessionOutcome};
