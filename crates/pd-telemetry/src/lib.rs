//! Logging initialisation and the `/metrics` snapshot.

pub mod logging;
pub mod metrics;

pub use metrics::MetricsSnapshot;
