//! Low-level coordination primitives.
//!
//! These are the leaf building blocks the rest of the crate is assembled
//! from: [`Deferred`] is a manually completable future, [`Gate`] a boolean
//! latch releasing its waiters on open, and [`AsyncPool`] a FIFO rendezvous
//! between value producers and consumers.

mod deferred;
mod gate;
mod pool;

pub use deferred::Deferred;
pub use gate::Gate;
pub use pool::AsyncPool;

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The state protected throughout this crate is best-effort registry
/// data (listener tables, pending tasks, waiter queues):
/// - There are no invariants spanning multiple fields.
/// - The worst outcome is a dropped registration or an unmatched value.
///
/// This avoids propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
