//! One-shot shutdown signal shared between the supervisor, signal handlers
//! and anyone else who needs to stop the daemon.

use tokio::sync::watch;

/// Owns the shutdown signal and waits on it.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

/// Cloneable trigger for a [`ShutdownCoordinator`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested. Returns immediately if it already was.
    pub async fn wait(&mut self) {
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}
