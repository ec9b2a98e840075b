//! Completion signal fired whenever a job leaves the running state.
//!
//! The signal carries no payload: it is a generation counter broadcast over a
//! `watch` channel. Waiters subscribe *before* testing their predicate, so a
//! completion that lands between the test and the wait is never missed. Every
//! wake may belong to an unrelated job; waiters re-test after each one.

use tokio::sync::watch;

/// Broadcast notification of job completions.
pub struct CompletionSignal {
    tx: watch::Sender<u64>,
}

/// A subscription to [`CompletionSignal`].
pub struct CompletionWaiter {
    rx: watch::Receiver<u64>,
}

impl CompletionSignal {
    /// Create a signal with generation 0.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Number of broadcasts so far.
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Subscribe. Only broadcasts after this call wake the returned waiter.
    pub fn subscribe(&self) -> CompletionWaiter {
        CompletionWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionWaiter {
    /// Wait for the next broadcast.
    ///
    /// Returns immediately if a broadcast happened since the last call (or
    /// since subscribing).
    pub async fn changed(&mut self) {
        // The sender lives as long as the registry that owns it; a closed
        // channel means the registry is gone and there is nothing to wait for.
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
