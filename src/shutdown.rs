//! Level-triggered shutdown signalling.
//!
//! A single [`Shutdown`] handle owned by the component that decides when to
//! stop; any number of [`Signal`] subscribers blocking in their select loops.
//! The signal is level-triggered: subscribers created after the trigger
//! observe it immediately.

use tokio::sync::watch;

/// Owner side of the shutdown signal.
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown handle.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Create a subscriber for this handle.
    pub fn subscribe(&self) -> Signal {
        Signal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Trigger the shutdown. Idempotent.
    pub fn trigger(&self) {
        // send_replace also works when no receivers are left.
        self.sender.send_replace(true);
    }

    /// Whether the shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of the shutdown signal.
#[derive(Clone)]
pub struct Signal {
    receiver: watch::Receiver<bool>,
}

impl Signal {
    /// Wait until the shutdown is triggered.
    ///
    /// Returns immediately if it already was. Also returns if the owning
    /// [`Shutdown`] has been dropped, which counts as a shutdown.
    pub async fn triggered(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check of the current level.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}
