use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::lock_ignore_poison;
use crate::{Error, Result};

/// A manually resolvable/rejectable future.
///
/// A `Deferred` couples a completion slot with the future awaiting it.
/// Clones share the same slot, so one side can be handed to a producer
/// (which calls [`resolve`](Self::resolve) or [`reject`](Self::reject))
/// while the other side awaits [`wait`](Self::wait). Settling is
/// exactly-once; later attempts are rejected and hand the value back.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
    rx: Mutex<Option<oneshot::Receiver<Result<T>>>>,
}

impl<T> Deferred<T> {
    // ---
    pub fn new() -> Self {
        // ---
        let (tx, rx) = oneshot::channel();

        Self {
            shared: Arc::new(Shared {
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Settle the deferred with a value.
    ///
    /// Returns `None` when the value was accepted for delivery. Returns
    /// `Some(value)` — handing the value back — when the deferred was
    /// already settled or the awaiting side is gone, so the caller can
    /// redirect it instead of losing it.
    pub fn resolve(&self, value: T) -> Option<T> {
        // ---
        let tx = lock_ignore_poison(&self.shared.tx).take();

        match tx {
            Some(tx) => match tx.send(Ok(value)) {
                Ok(()) => None,
                Err(Ok(value)) => Some(value),
                Err(Err(_)) => None,
            },
            None => Some(value),
        }
    }

    /// Settle the deferred with an error.
    ///
    /// Returns `true` if this call performed the settling.
    pub fn reject(&self, error: Error) -> bool {
        // ---
        match lock_ignore_poison(&self.shared.tx).take() {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Whether the deferred has been resolved or rejected.
    pub fn is_settled(&self) -> bool {
        lock_ignore_poison(&self.shared.tx).is_none()
    }

    /// Whether the awaiting side has gone away before settlement.
    pub fn is_abandoned(&self) -> bool {
        lock_ignore_poison(&self.shared.tx)
            .as_ref()
            .is_some_and(|tx| tx.is_closed())
    }

    /// Await the outcome. May be called once across all clones.
    ///
    /// # Errors
    ///
    /// Returns the rejection error if the deferred was rejected,
    /// `Error::Disposed` if every completion handle was dropped before
    /// settlement, and `Error::InvalidArgument` on a second `wait`.
    pub async fn wait(&self) -> Result<T> {
        // ---
        let rx = lock_ignore_poison(&self.shared.rx)
            .take()
            .ok_or_else(|| Error::InvalidArgument("deferred already awaited".into()))?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Disposed),
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_resolve_settles_once() {
        // ---
        let deferred = Deferred::new();
        let producer = deferred.clone();

        assert!(producer.resolve(7).is_none());
        assert!(producer.is_settled());
        assert_eq!(producer.resolve(8), Some(8));

        assert_eq!(deferred.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_reject_propagates_error() {
        // ---
        let deferred: Deferred<u32> = Deferred::new();
        assert!(deferred.reject(Error::Timeout));
        assert!(!deferred.reject(Error::Timeout));

        assert!(matches!(deferred.wait().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_second_wait_fails() {
        // ---
        let deferred = Deferred::new();
        deferred.resolve(1);
        deferred.wait().await.unwrap();

        assert!(matches!(
            deferred.wait().await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_abandonment_is_visible() {
        // ---
        let deferred: Deferred<u32> = Deferred::new();
        assert!(!deferred.is_abandoned());

        drop(lock_ignore_poison(&deferred.shared.rx).take());
        assert!(deferred.is_abandoned());
        assert_eq!(deferred.resolve(3), Some(3));
    }
}
