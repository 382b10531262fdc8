//! Cancellation for blocking lookups

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag; once cancelled it stays cancelled
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl CancelToken {
    /// Create token
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Cancel every waiter, current and future
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
