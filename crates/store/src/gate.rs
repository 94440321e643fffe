use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// One-shot latch flipped after the first full list is merged into the store.
///
/// Clones share the latch. Every waiter is woken by the same flip.
#[derive(Clone)]
pub struct SyncGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SyncGate {
    fn default() -> Self { Self::new() }
}

impl SyncGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_synced(&self) -> bool { *self.tx.borrow() }

    /// Flip the gate. Returns true only for the call that performed the flip.
    pub fn mark_synced(&self) -> bool {
        let flipped = self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        });
        if flipped {
            debug!("sync gate open");
        }
        flipped
    }

    /// Wait until the gate opens or `stop` completes, whichever comes first.
    ///
    /// `stop` is typically a deadline (`tokio::time::sleep`) or a cancellation
    /// (`CancellationToken::cancelled`). Returns whether the gate is open.
    pub async fn wait_until_synced<F>(&self, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = stop => self.is_synced(),
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until_synced(tokio::time::sleep(timeout)).await
    }
}
