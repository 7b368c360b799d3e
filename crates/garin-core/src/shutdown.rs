use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide stop signal. Cloneable, and safe to trigger from any thread
/// any number of times.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true for the call that actually flipped the signal.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // The sender lives in self, so this only ends once the flag is set.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
