//! Shutdown signalling for accept loops.

use tokio::sync::watch;

/// Broadcasts a one-shot stop request to every listener.
///
/// Backed by a `watch` channel so a listener subscribing after the
/// signal fired still observes it.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create a new, untriggered shutdown signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Wait until shutdown is triggered.
    ///
    /// Also returns if every [`ShutdownSignal`] handle was dropped.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}
