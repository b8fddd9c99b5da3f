//! One-shot cancellation signal shared between a fetcher and its owner

use tokio::sync::watch;

/// Create a linked handle/token pair
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Owner side: requests cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Worker side: observes cancellation
///
/// Dropping the [`CancelHandle`] counts as cancellation, so orphaned workers
/// wind down instead of running forever.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Check without waiting
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancellation has been requested
    ///
    /// Cancel-safe: may be used as a `select!` branch repeatedly.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (handle, mut token) = cancellation();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let (handle, mut token) = cancellation();
        drop(handle);
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (handle, token) = cancellation();
        let other = token.clone();
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
    }
}
