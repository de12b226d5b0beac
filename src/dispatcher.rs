//! Local publish/subscribe keyed by string name.
//!
//! The dispatcher is the in-process fan-out primitive behind both
//! backends: the memory backend delivers channel messages through it, and
//! the broker backend uses a second instance to route RPC replies by
//! correlation id. Listeners are async, registered under a string key, and
//! removed through the [`Disposable`] returned at registration.
//!
//! How a registered key matches an emitted name is a pluggable
//! [`EventMatcher`] strategy. The default is exact string equality, which
//! is all the messaging core relies on; [`RegexMatcher`] is available for
//! callers that want pattern-keyed listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use regex::Regex;
use serde_json::Value;

use crate::sync::lock_ignore_poison;
use crate::{log_warn, Disposable, Error, Result};

/// Outcome of a single listener invocation.
pub type ListenerResult = Result<Value>;

/// Type-erased async event listener.
pub type EventListener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

/// Wrap a typed async closure into an [`EventListener`].
pub fn event_listener<T, F, Fut>(f: F) -> EventListener<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ListenerResult> + Send + 'static,
{
    // ---
    Arc::new(move |event: T| {
        let fut = f(event);
        Box::pin(fut) as BoxFuture<'static, ListenerResult>
    })
}

/// Strategy deciding whether a registered key receives an emitted event.
pub trait EventMatcher: Send + Sync {
    fn matches(&self, registered: &str, emitted: &str) -> bool;
}

/// Exact string equality. The default, and the only matching the
/// messaging core depends on.
pub struct ExactMatcher;

impl EventMatcher for ExactMatcher {
    fn matches(&self, registered: &str, emitted: &str) -> bool {
        registered == emitted
    }
}

/// Treats each registered key as a regular expression.
///
/// Patterns are compiled once per key and cached. A key that fails to
/// compile falls back to exact comparison.
pub struct RegexMatcher {
    cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        // ---
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RegexMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMatcher for RegexMatcher {
    fn matches(&self, registered: &str, emitted: &str) -> bool {
        // ---
        let mut cache = lock_ignore_poison(&self.cache);
        let compiled = cache.entry(registered.to_string()).or_insert_with(|| {
            Regex::new(registered)
                .map_err(|_err| {
                    log_warn!("listener key is not a valid pattern: {registered}");
                })
                .ok()
        });

        match compiled {
            Some(regex) => regex.is_match(emitted),
            None => registered == emitted,
        }
    }
}

struct Registration<T> {
    id: u64,
    key: String,
    // `None` = unbounded; `Some(n)` auto-removes after n deliveries.
    remaining: Option<usize>,
    listener: EventListener<T>,
}

struct DispatcherState<T> {
    disposed: bool,
    next_id: u64,
    registrations: Vec<Registration<T>>,
}

/// String-keyed local publish/subscribe.
///
/// Cheap to clone; clones share one listener table.
pub struct EventDispatcher<T> {
    state: Arc<Mutex<DispatcherState<T>>>,
    matcher: Arc<dyn EventMatcher>,
}

impl<T> Clone for EventDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            matcher: Arc::clone(&self.matcher),
        }
    }
}

impl<T: Clone + Send + 'static> EventDispatcher<T> {
    /// Create a dispatcher with exact-match semantics.
    pub fn new() -> Self {
        Self::with_matcher(Arc::new(ExactMatcher))
    }

    /// Create a dispatcher with a custom key-matching strategy.
    pub fn with_matcher(matcher: Arc<dyn EventMatcher>) -> Self {
        // ---
        Self {
            state: Arc::new(Mutex::new(DispatcherState {
                disposed: false,
                next_id: 0,
                registrations: Vec::new(),
            })),
            matcher,
        }
    }

    /// Register an unbounded listener under `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Disposed` if the dispatcher has been disposed.
    pub fn on(&self, key: &str, listener: EventListener<T>) -> Result<Disposable> {
        self.register(key, None, listener)
    }

    /// Register a listener that auto-removes after one delivery.
    pub fn once(&self, key: &str, listener: EventListener<T>) -> Result<Disposable> {
        self.register(key, Some(1), listener)
    }

    /// Register a listener that auto-removes after `count` deliveries.
    pub fn many(&self, key: &str, count: usize, listener: EventListener<T>) -> Result<Disposable> {
        // ---
        if count == 0 {
            return Err(Error::InvalidArgument(
                "listener invocation count must be at least 1".into(),
            ));
        }
        self.register(key, Some(count), listener)
    }

    fn register(
        &self,
        key: &str,
        remaining: Option<usize>,
        listener: EventListener<T>,
    ) -> Result<Disposable> {
        // ---
        let id = {
            let mut state = lock_ignore_poison(&self.state);
            if state.disposed {
                return Err(Error::Disposed);
            }

            let id = state.next_id;
            state.next_id += 1;
            state.registrations.push(Registration {
                id,
                key: key.to_string(),
                remaining,
                listener,
            });
            id
        };

        let state = Arc::clone(&self.state);
        Ok(Disposable::new(move || {
            let mut state = lock_ignore_poison(&state);
            state.registrations.retain(|reg| reg.id != id);
        }))
    }

    /// Remove every listener registered under exactly `key`.
    ///
    /// Returns the number of listeners removed.
    pub fn off(&self, key: &str) -> usize {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let before = state.registrations.len();
        state.registrations.retain(|reg| reg.key != key);
        before - state.registrations.len()
    }

    /// Collect listeners matching `name`, consuming bounded counts.
    fn matching(&self, name: &str) -> Vec<EventListener<T>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let matcher = &self.matcher;
        let mut matched = Vec::new();

        state.registrations.retain_mut(|reg| {
            if !matcher.matches(&reg.key, name) {
                return true;
            }

            matched.push(Arc::clone(&reg.listener));
            match reg.remaining.as_mut() {
                Some(left) => {
                    *left -= 1;
                    *left > 0
                }
                None => true,
            }
        });

        matched
    }

    /// Deliver an event to every matching listener, in registration
    /// order, discarding their values.
    ///
    /// # Errors
    ///
    /// The first listener failure is propagated; listeners registered
    /// after the failing one are not invoked for this event.
    pub async fn emit(&self, name: &str, event: T) -> Result<()> {
        // ---
        for listener in self.matching(name) {
            listener(event.clone()).await?;
        }
        Ok(())
    }

    /// Deliver an event to every matching listener concurrently and
    /// collect their values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Disposed` if the dispatcher has been disposed, or
    /// the first listener failure otherwise.
    pub async fn emit_async(&self, name: &str, event: T) -> Result<Vec<Value>> {
        // ---
        if lock_ignore_poison(&self.state).disposed {
            return Err(Error::Disposed);
        }

        let listeners = self.matching(name);
        let outcomes = join_all(
            listeners
                .into_iter()
                .map(|listener| listener(event.clone())),
        )
        .await;

        outcomes.into_iter().collect()
    }

    /// Drop every registration and refuse further ones.
    pub fn dispose(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.disposed = true;
        state.registrations.clear();
    }
}

impl<T: Clone + Send + 'static> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}
