//! Caps on the two long-lived connection populations (long-poll waiters and
//! stream subscribers), globally and per origin. Guards release their slot
//! on drop, so abnormal disconnects can never leak a counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    LongPoll,
    Stream,
}

impl ConnKind {
    fn label(&self) -> &'static str {
        match self {
            ConnKind::LongPoll => "long-poll",
            ConnKind::Stream => "stream",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionRefused {
    #[error("too many {kind} connections (max {max})")]
    Global { kind: &'static str, max: usize },

    #[error("too many {kind} connections from this origin (max {max})")]
    PerOrigin { kind: &'static str, max: usize },
}

#[derive(Debug, Default)]
struct Counters {
    long_poll_total: usize,
    stream_total: usize,
    per_origin: HashMap<(String, ConnKind), usize>,
}

/// Shared tracker. Critical sections are short and never span I/O.
#[derive(Debug)]
pub struct ConnectionTracker {
    long_poll_max: usize,
    stream_max: usize,
    per_origin_max: usize,
    counters: Mutex<Counters>,
}

impl ConnectionTracker {
    pub fn new(long_poll_max: usize, stream_max: usize, per_origin_max: usize) -> Arc<Self> {
        Arc::new(Self {
            long_poll_max,
            stream_max,
            per_origin_max,
            counters: Mutex::new(Counters::default()),
        })
    }

    /// Reserve a slot. The returned guard releases it when dropped.
    pub fn try_open(
        self: &Arc<Self>,
        origin: &str,
        kind: ConnKind,
    ) -> Result<ConnectionGuard, ConnectionRefused> {
        let mut counters = self.counters.lock().expect("connection tracker lock");
        let (total, max) = match kind {
            ConnKind::LongPoll => (&mut counters.long_poll_total, self.long_poll_max),
            ConnKind::Stream => (&mut counters.stream_total, self.stream_max),
        };
        if *total >= max {
            return Err(ConnectionRefused::Global {
                kind: kind.label(),
                max,
            });
        }
        let origin_count = counters
            .per_origin
            .entry((origin.to_string(), kind))
            .or_insert(0);
        if *origin_count >= self.per_origin_max {
            return Err(ConnectionRefused::PerOrigin {
                kind: kind.label(),
                max: self.per_origin_max,
            });
        }
        *origin_count += 1;
        match kind {
            ConnKind::LongPoll => counters.long_poll_total += 1,
            ConnKind::Stream => counters.stream_total += 1,
        }
        Ok(ConnectionGuard {
            tracker: Arc::clone(self),
            origin: origin.to_string(),
            kind,
        })
    }

    /// Current totals `(long_poll, stream)`.
    pub fn totals(&self) -> (usize, usize) {
        let counters = self.counters.lock().expect("connection tracker lock");
        (counters.long_poll_total, counters.stream_total)
    }

    fn release(&self, origin: &str, kind: ConnKind) {
        let mut counters = self.counters.lock().expect("connection tracker lock");
        match kind {
            ConnKind::LongPoll => {
                counters.long_poll_total = counters.long_poll_total.saturating_sub(1)
            }
            ConnKind::Stream => counters.stream_total = counters.stream_total.saturating_sub(1),
        }
        let key = (origin.to_string(), kind);
        if let Some(count) = counters.per_origin.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_origin.remove(&key);
            }
        }
    }
}

/// RAII slot held for the lifetime of a long-poll wait or stream.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    origin: String,
    kind: ConnKind,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.origin, self.kind);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_origin_cap_is_independent_per_population() {
        let tracker = ConnectionTracker::new(50, 100, 2);
        let _p1 = tracker.try_open("origin-a", ConnKind::LongPoll).unwrap();
        let _p2 = tracker.try_open("origin-a", ConnKind::LongPoll).unwrap();
        assert!(tracker.try_open("origin-a", ConnKind::LongPoll).is_err());
        // Streams have their own per-origin budget.
        let _s1 = tracker.try_open("origin-a", ConnKind::Stream).unwrap();
        let _s2 = tracker.try_open("origin-a", ConnKind::Stream).unwrap();
        assert!(tracker.try_open("origin-a", ConnKind::Stream).is_err());
        // Other origins are unaffected.
        let _other = tracker.try_open("origin-b", ConnKind::LongPoll).unwrap();
    }

    #[test]
    fn global_cap_applies_across_origins() {
        let tracker = ConnectionTracker::new(2, 2, 5);
        let _a = tracker.try_open("a", ConnKind::LongPoll).unwrap();
        let _b = tracker.try_open("b", ConnKind::LongPoll).unwrap();
        let err = tracker.try_open("c", ConnKind::LongPoll).unwrap_err();
        assert_eq!(
            err,
            ConnectionRefused::Global {
                kind: "long-poll",
                max: 2
            }
        );
    }

    #[test]
    fn drop_releases_slot() {
        let tracker = ConnectionTracker::new(1, 1, 1);
        let guard = tracker.try_open("a", ConnKind::LongPoll).unwrap();
        assert_eq!(tracker.totals(), (1, 0));
        drop(guard);
        assert_eq!(tracker.totals(), (0, 0));
        // Slot is reusable immediately after drop.
        let _again = tracker.try_open("a", ConnKind::LongPoll).unwrap();
    }
}
