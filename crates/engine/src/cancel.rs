//! The session cancellation flag: set once, read everywhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Cooperative cancellation flag owned by a [`crate::ChatSession`].
///
/// Two read surfaces serve two kinds of consumers: a lock-free probe for the
/// sandbox's progress hook (checked thousands of times per second), and a
/// `watch` receiver for async code that wants to be woken the moment the
/// flag flips (the provider stream loop, the service's turn serialization).
/// Raising is idempotent; the flag never resets.
#[derive(Clone)]
pub struct CancelFlag {
    raised: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { raised: Arc::new(AtomicBool::new(false)), tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            // No receivers is fine — the probe still observes the flag.
            let _ = self.tx.send(true);
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lock-free view for synchronous hot paths (script progress hook).
    pub fn probe(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.raised)
    }

    /// Wakeable view for async suspension points.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_idempotent_and_visible_everywhere() {
        let flag = CancelFlag::new();
        let probe = flag.probe();
        assert!(!flag.is_raised());
        assert!(!probe.load(Ordering::SeqCst));

        flag.raise();
        flag.raise();
        assert!(flag.is_raised());
        assert!(probe.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn subscribers_wake_on_raise() {
        let flag = CancelFlag::new();
        let mut rx = flag.subscribe();
        assert!(!*rx.borrow());

        let raiser = flag.clone();
        tokio::spawn(async move { raiser.raise() });

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn late_subscribers_see_the_raised_state() {
        let flag = CancelFlag::new();
        flag.raise();
        let rx = flag.subscribe();
        assert!(*rx.borrow());
    }
}
