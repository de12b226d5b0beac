use std::sync::Mutex;

use super::{lock_ignore_poison, Deferred};
use crate::Result;

/// A boolean latch with waiters released on open.
///
/// While closed, [`wait`](Self::wait) parks callers; [`open`](Self::open)
/// releases every parked waiter at once. While open, `wait` returns
/// immediately. [`close`](Self::close) re-arms the latch for subsequent
/// callers without affecting anyone already released.
pub struct Gate {
    state: Mutex<GateState>,
}

struct GateState {
    open: bool,
    waiters: Vec<Deferred<()>>,
}

impl Gate {
    /// Create a closed gate.
    pub fn new() -> Self {
        // ---
        Self {
            state: Mutex::new(GateState {
                open: false,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        lock_ignore_poison(&self.state).open
    }

    /// Open the latch and release all parked waiters.
    pub fn open(&self) {
        // ---
        let waiters = {
            let mut state = lock_ignore_poison(&self.state);
            state.open = true;
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            let _ = waiter.resolve(());
        }
    }

    /// Close the latch; later callers of `wait` will park again.
    pub fn close(&self) {
        lock_ignore_poison(&self.state).open = false;
    }

    /// Resolve immediately if open, otherwise park until the next `open()`.
    pub async fn wait(&self) -> Result<()> {
        // ---
        let waiter = {
            let mut state = lock_ignore_poison(&self.state);
            if state.open {
                return Ok(());
            }

            let deferred = Deferred::new();
            state.waiters.push(deferred.clone());
            deferred
        };

        waiter.wait().await
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_open() {
        // ---
        let gate = Gate::new();
        gate.open();
        timeout(Duration::from_millis(100), gate.wait())
            .await
            .expect("open gate should not park")
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_releases_parked_waiters() {
        // ---
        let gate = Arc::new(Gate::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.wait().await }));
        }

        // Give the waiters a chance to park before opening.
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.open();

        for handle in handles {
            timeout(Duration::from_millis(500), handle)
                .await
                .expect("waiter not released")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_rearms_the_latch() {
        // ---
        let gate = Gate::new();
        gate.open();
        gate.close();

        assert!(!gate.is_open());
        assert!(timeout(Duration::from_millis(50), gate.wait())
            .await
            .is_err());
    }
}
