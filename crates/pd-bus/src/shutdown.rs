//! Cooperative shutdown coordination. Long-lived tasks subscribe and
//! `select!` the receiver against their work loop; the lifecycle layer
//! triggers once and waits (bounded) for drain confirmations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Idempotent: only the first call broadcasts.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Confirm one component finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` drain confirmations, bounded by `timeout`.
    /// Returns the number confirmed either way.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drain_rx.borrow();
            if current >= expected {
                return current;
            }
            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.drain_rx.borrow(),
                Err(_) => {
                    let current = *self.drain_rx.borrow();
                    warn!(current, expected, "drain timed out");
                    return current;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard confirming drain on drop.
pub struct DrainGuard {
    signal: ShutdownSignal,
}

impl DrainGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_wake_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("woken")
            .expect("recv");
    }

    #[tokio::test]
    async fn drain_guards_confirm_on_drop() {
        let mut signal = ShutdownSignal::new();
        let g1 = DrainGuard::new(signal.clone());
        let g2 = DrainGuard::new(signal.clone());
        signal.trigger();
        tokio::spawn(async move {
            drop(g1);
            drop(g2);
        });
        let confirmed = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(confirmed, 2);
    }

    #[tokio::test]
    async fn drain_wait_is_bounded() {
        let mut signal = ShutdownSignal::new();
        let _held = DrainGuard::new(signal.clone());
        signal.trigger();
        let confirmed = signal.wait_for_drain(1, Duration::from_millis(50)).await;
        assert_eq!(confirmed, 0);
    }
}
