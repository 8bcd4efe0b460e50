//! Listens for the server shutdown signal.
//!
//! The shutdown signal is delivered through a [`broadcast::Receiver`]; only
//! a single value is ever sent on the channel. Once a value has been sent,
//! the server should shut down.
//!
//! The [`Shutdown`] struct listens for the signal and tracks whether it has
//! been received. Callers may query [`Shutdown::is_shutdown`] to see
//! whether the signal has been received.

use tokio::sync::broadcast;

/// Tracks whether a shutdown signal has been received.
pub(crate) struct Shutdown {
    /// `true` once the shutdown signal has been received.
    shutdown: bool,

    /// The receiving half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Creates a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown { shutdown: false, notify }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receives the shutdown notice, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Only one value is ever sent, so a lag error can't happen here.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}
