//! Fan-out plumbing: the append-only channel message log, the in-process
//! event bus feeding the webhook pipeline, and the connection tracker that
//! caps long-poll and stream subscribers.

pub mod connections;
pub mod events;
pub mod messages;
pub mod shutdown;

pub use connections::{ConnKind, ConnectionGuard, ConnectionRefused, ConnectionTracker};
pub use events::{DaemonEvent, EventBus};
pub use messages::{MessageError, MessageLog};
pub use shutdown::{DrainGuard, ShutdownSignal};
