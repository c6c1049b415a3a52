//! Module to control shutdown in dripfeed.
//!
//! Registration may be mid-retry and the publisher mid-tick when the operator
//! asks for shutdown. Everything that participates in controlled shutdown does
//! so by holding a clone of [`Shutdown`] and pairing its `recv` against its
//! working future in a select loop.

use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(Debug)]
/// Mechanism to control shutdown in dripfeed.
///
/// There is one root instance, created by the binary; every long-running task
/// receives a clone. Tripping [`Shutdown::signal`] on any instance resolves
/// [`Shutdown::recv`] on all of them.
pub struct Shutdown {
    /// The broadcast sender, singleton for all `Shutdown` instances derived
    /// from the same root.
    sender: Arc<broadcast::Sender<()>>,

    /// The receive half of the channel used to listen for shutdown. One per
    /// instance.
    notify: broadcast::Receiver<()>,

    /// `true` if the shutdown signal has been received
    received: bool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new `Shutdown` instance. There should be only one call to this
    /// function and all subsequent instances should be created through clones.
    #[must_use]
    pub fn new() -> Self {
        let (sender, notify) = broadcast::channel(1);

        Self {
            sender: Arc::new(sender),
            notify,
            received: false,
        }
    }

    /// Receive the shutdown notice. This function will block if a notice has
    /// not already been sent.
    pub async fn recv(&mut self) {
        if self.received {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        self.received = true;
    }

    /// Send the shutdown signal through to this and all derived `Shutdown`
    /// instances.
    pub fn signal(&self) {
        // A send error means there are no listeners left, nothing to do.
        let _ = self.sender.send(());
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        let notify = self.sender.subscribe();

        Self {
            sender: Arc::clone(&self.sender),
            notify,
            received: self.received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_every_clone() {
        let root = Shutdown::new();
        let mut first = root.clone();
        let mut second = root.clone();

        root.signal();

        first.recv().await;
        second.recv().await;
    }

    #[tokio::test]
    async fn recv_after_signal_returns_immediately() {
        let root = Shutdown::new();
        let mut watcher = root.clone();
        root.signal();

        watcher.recv().await;
        // A second call must not block on the drained channel.
        watcher.recv().await;
    }
}
