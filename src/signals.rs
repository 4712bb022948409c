//! A single shutdown signal fanned out to every long-running task.
//!
//! The supervisor installs SIGTERM/SIGINT handlers once and flips a
//! `tokio::sync::watch` cell; every clone of [`Shutdown`] observes the flip
//! the next time it's polled. This stands in for the process-global
//! `keep_listening`/`keep_working` flags of the original implementation,
//! generalized to a value that can be cloned into each task instead of a
//! single global.

use tokio::sync::watch;

/// A cloneable handle to the process-wide shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// The supervisor-owned side; dropping it leaves every [`Shutdown`] clone
/// permanently in its last-observed state.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

/// Create a fresh, unfired shutdown signal and its trigger.
#[must_use]
pub fn new() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx }, Shutdown { rx })
}

impl Trigger {
    /// Fire the shutdown signal. Idempotent.
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// True if shutdown has already been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been signalled. Resolves immediately on
    /// every call after the first.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // `changed` only resolves on transitions, so a task that starts
        // after the flag is already true must check first, above.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}
