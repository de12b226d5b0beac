use std::collections::VecDeque;
use std::sync::Mutex;

use super::{lock_ignore_poison, Deferred};
use crate::Result;

/// FIFO matching of value producers and consumers.
///
/// [`release`](Self::release) hands a value to the oldest parked
/// [`acquire`](Self::acquire)r, or buffers it when nobody is waiting;
/// `acquire` takes the oldest buffered value, or parks until the next
/// `release`. Producers never block — a slow consumer only accumulates
/// buffered entries.
pub struct AsyncPool<T> {
    state: Mutex<PoolState<T>>,
}

struct PoolState<T> {
    values: VecDeque<T>,
    waiters: VecDeque<Deferred<T>>,
}

impl<T> AsyncPool<T> {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            state: Mutex::new(PoolState {
                values: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Hand a value to the oldest waiter, or buffer it.
    ///
    /// A waiter whose acquire future was dropped is skipped; the value
    /// moves on to the next one in line.
    pub fn release(&self, value: T) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let mut value = value;

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.resolve(value) {
                None => return,
                Some(returned) => value = returned,
            }
        }

        state.values.push_back(value);
    }

    /// Take the oldest buffered value, or park until one is released.
    pub async fn acquire(&self) -> Result<T> {
        // ---
        let waiter = {
            let mut state = lock_ignore_poison(&self.state);
            if let Some(value) = state.values.pop_front() {
                return Ok(value);
            }

            let deferred = Deferred::new();
            state.waiters.push_back(deferred.clone());
            deferred
        };

        // No await point sits between parking and taking the receiver, so
        // a dropped acquire future can never swallow a released value.
        waiter.wait().await
    }

    /// Number of buffered values not yet claimed by any consumer.
    pub fn buffered(&self) -> usize {
        lock_ignore_poison(&self.state).values.len()
    }
}

impl<T> Default for AsyncPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
