//! Idempotent resource-lifecycle primitives.
//!
//! Every cancellable registration in the crate (event listeners, queue
//! consumers, the pending-task retry timer, broker consumer tags) is
//! represented as a [`Disposable`] wrapping its teardown action. Backends
//! anchor all of them to one owning [`CompositeDisposable`] so that
//! `disconnect()` deterministically releases everything.

use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};

use crate::sync::lock_ignore_poison;

enum Teardown {
    Sync(Box<dyn FnOnce() + Send>),
    Async(BoxFuture<'static, ()>),
}

/// A single idempotent teardown action.
///
/// Transitions Active → Disposed exactly once; disposing twice is a no-op.
/// Clones share the same underlying action.
#[derive(Clone)]
pub struct Disposable {
    inner: Arc<Inner>,
}

struct Inner {
    teardown: Mutex<Option<Teardown>>,
}

impl Disposable {
    /// Wrap a synchronous teardown action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self::from_teardown(Teardown::Sync(Box::new(action)))
    }

    /// Wrap an asynchronous teardown action.
    ///
    /// `dispose_async` awaits it; plain `dispose` spawns it onto the
    /// current runtime instead.
    pub fn from_future(action: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        Self::from_teardown(Teardown::Async(Box::pin(action)))
    }

    fn from_teardown(teardown: Teardown) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                teardown: Mutex::new(Some(teardown)),
            }),
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock_ignore_poison(&self.inner.teardown).is_none()
    }

    /// Run the teardown action at most once.
    pub fn dispose(&self) {
        // ---
        match lock_ignore_poison(&self.inner.teardown).take() {
            Some(Teardown::Sync(action)) => action(),
            Some(Teardown::Async(action)) => {
                tokio::spawn(action);
            }
            None => {}
        }
    }

    /// Run the teardown action at most once, awaiting an async action.
    pub async fn dispose_async(&self) {
        // ---
        let taken = lock_ignore_poison(&self.inner.teardown).take();
        match taken {
            Some(Teardown::Sync(action)) => action(),
            Some(Teardown::Async(action)) => action.await,
            None => {}
        }
    }

    fn same_handle(&self, other: &Disposable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Aggregates many [`Disposable`]s and tears them all down together.
///
/// `add`, `remove` and `clear` are no-ops once the composite itself has
/// been disposed.
#[derive(Clone)]
pub struct CompositeDisposable {
    // `None` marks the composite itself as disposed.
    members: Arc<Mutex<Option<Vec<Disposable>>>>,
}

impl CompositeDisposable {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            members: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock_ignore_poison(&self.members).is_none()
    }

    /// Track a disposable for collective teardown.
    pub fn add(&self, disposable: Disposable) {
        // ---
        if let Some(members) = lock_ignore_poison(&self.members).as_mut() {
            members.push(disposable);
        }
    }

    /// Stop tracking a disposable without disposing it.
    ///
    /// Returns `true` if the handle was held.
    pub fn remove(&self, disposable: &Disposable) -> bool {
        // ---
        match lock_ignore_poison(&self.members).as_mut() {
            Some(members) => {
                let before = members.len();
                members.retain(|held| !held.same_handle(disposable));
                members.len() != before
            }
            None => false,
        }
    }

    /// Dispose current members and empty the set, keeping the composite
    /// itself usable.
    pub fn clear(&self) {
        // ---
        let drained = match lock_ignore_poison(&self.members).as_mut() {
            Some(members) => std::mem::take(members),
            None => return,
        };

        for member in drained {
            member.dispose();
        }
    }

    /// Dispose every held member, then mark the composite disposed and
    /// release the set.
    pub fn dispose(&self) {
        // ---
        let members = lock_ignore_poison(&self.members).take();

        for member in members.into_iter().flatten() {
            member.dispose();
        }
    }

    /// Like [`dispose`](Self::dispose), but members with async teardown
    /// actions are awaited, concurrently.
    pub async fn dispose_async(&self) {
        // ---
        let members = lock_ignore_poison(&self.members).take();

        if let Some(members) = members {
            join_all(members.iter().map(|member| member.dispose_async())).await;
        }
    }
}

impl Default for CompositeDisposable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting() -> (Disposable, Arc<AtomicUsize>) {
        // ---
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let disposable = Disposable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (disposable, count)
    }

    #[test]
    fn test_dispose_runs_action_once() {
        // ---
        let (disposable, count) = counting();
        assert!(!disposable.is_disposed());

        disposable.dispose();
        disposable.dispose();

        assert!(disposable.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_async_is_idempotent_across_clones() {
        // ---
        let (disposable, count) = counting();
        let other = disposable.clone();

        disposable.dispose_async().await;
        other.dispose();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_teardown_runs_once() {
        // ---
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let disposable = Disposable::from_future(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        disposable.dispose_async().await;
        disposable.dispose_async().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_composite_disposes_members_exactly_once() {
        // ---
        let composite = CompositeDisposable::new();
        let (a, count_a) = counting();
        let (b, count_b) = counting();
        composite.add(a);
        composite.add(b);

        composite.dispose_async().await;
        composite.dispose_async().await;
        composite.dispose();

        assert!(composite.is_disposed());
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutators_are_noops_after_dispose() {
        // ---
        let composite = CompositeDisposable::new();
        composite.dispose();

        let (orphan, count) = counting();
        composite.add(orphan.clone());
        composite.clear();

        assert!(!composite.remove(&orphan));
        assert!(!orphan.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_keeps_composite_usable() {
        // ---
        let composite = CompositeDisposable::new();
        let (a, count_a) = counting();
        composite.add(a);

        composite.clear();
        assert!(!composite.is_disposed());
        assert_eq!(count_a.load(Ordering::SeqCst), 1);

        let (b, count_b) = counting();
        composite.add(b);
        composite.dispose();
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_member_is_not_disposed() {
        // ---
        let composite = CompositeDisposable::new();
        let (a, count_a) = counting();
        composite.add(a.clone());

        assert!(composite.remove(&a));
        composite.dispose();
        assert_eq!(count_a.load(Ordering::SeqCst), 0);
    }
}
