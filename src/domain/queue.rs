// src/domain/queue.rs

//! The messaging contract.
//!
//! A [`MessageQueue`] offers three interaction patterns over one uniform
//! surface, without exposing which backend is active:
//!
//! - **broadcast publish/subscribe** — every listener subscribed to a
//!   `(name, topic)` channel receives every published message;
//! - **load-balanced work queues** — each task sent to a named queue is
//!   delivered to exactly one of its consumers, round-robin;
//! - **request/reply (RPC)** — a task sent to a queue whose consumer's
//!   return value (or failure) travels back to the caller.
//!
//! Backends provide best-effort delivery: no persistence beyond what the
//! underlying transport offers, no exactly-once semantics, no ordering
//! across consumers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::dispatcher::{EventListener, ListenerResult};
use crate::sync::AsyncPool;
use crate::{Disposable, Error, Message, Result};

/// Shared queue pointer.
///
/// An `Arc<dyn MessageQueue>`: cheap to clone, erases the concrete
/// backend behind the stable contract.
pub type QueuePtr = Arc<dyn MessageQueue>;

/// Listener attached to a broadcast channel.
pub type SubscribeListener = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Listener attached to a work queue.
///
/// Returns the optional reply payload; `None` means "handled, nothing to
/// say" (an RPC caller then receives a bare timestamp message). Raising an
/// error signals failure to the RPC caller, or re-queues a fire-and-forget
/// task.
pub type ConsumeListener =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Wrap a typed async closure into a [`SubscribeListener`].
pub fn subscriber<F, Fut>(f: F) -> SubscribeListener
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    // ---
    Arc::new(move |msg: Message| {
        let fut = f(msg);
        Box::pin(fut) as BoxFuture<'static, ()>
    })
}

/// Wrap a typed async closure into a [`ConsumeListener`].
pub fn consumer<F, Fut>(f: F) -> ConsumeListener
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Value>>> + Send + 'static,
{
    // ---
    Arc::new(move |msg: Message| {
        let fut = f(msg);
        Box::pin(fut) as BoxFuture<'static, Result<Option<Value>>>
    })
}

/// Dispatcher key for a broadcast channel.
pub(crate) fn channel_key(name: &str, topic: Option<&str>) -> String {
    // ---
    match topic {
        Some(topic) if !topic.is_empty() => format!("channel:{name}:{topic}"),
        _ => format!("channel:{name}"),
    }
}

/// Validate a channel/queue name before any I/O.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    // ---
    if name.is_empty() {
        return Err(Error::InvalidArgument(
            "channel/queue name must be a non-empty string".into(),
        ));
    }
    Ok(())
}

/// Adapt a [`SubscribeListener`] into a dispatcher listener.
pub(crate) fn forward_subscriber(listener: SubscribeListener) -> EventListener<Message> {
    // ---
    Arc::new(move |msg: Message| {
        let fut = listener(msg);
        Box::pin(async move {
            fut.await;
            Ok(Value::Null)
        }) as BoxFuture<'static, ListenerResult>
    })
}

/// The uniform messaging contract implemented by every backend.
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    // ---
    /// Ready the backend. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` when the transport cannot be reached.
    async fn connect(&self) -> Result<()>;

    /// Release every resource owned by the backend: timers, listener
    /// registrations, broker channels. Idempotent; all subsequent
    /// operations fail with `Error::Disposed`.
    async fn disconnect(&self) -> Result<()>;

    /// Broadcast a payload on the `(name, topic)` channel.
    ///
    /// Delivery is fire-and-forget: with no subscriber registered, the
    /// message is dropped.
    async fn publish(&self, name: &str, topic: Option<&str>, payload: Value) -> Result<()>;

    /// Attach a listener to the `(name, topic)` channel.
    ///
    /// The returned [`Disposable`] detaches it.
    async fn subscribe(
        &self,
        name: &str,
        topic: Option<&str>,
        listener: SubscribeListener,
    ) -> Result<Disposable>;

    /// Fire a task into a work queue.
    ///
    /// With no consumer registered the task is buffered and retried until
    /// one appears — indefinitely, by design; disposal of the backend is
    /// the only bound.
    async fn send(&self, queue: &str, task: Value) -> Result<()>;

    /// Send a task and await its consumer's reply.
    ///
    /// `timeout` falls back to the configured default when `None`.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` when the deadline elapses first
    /// - `Error::Consumer` when the consumer raised
    async fn rpc(&self, queue: &str, task: Value, timeout: Option<Duration>) -> Result<Message>;

    /// Register a consumer on a work queue.
    ///
    /// Tasks are distributed round-robin among a queue's consumers. The
    /// returned [`Disposable`] deregisters this one.
    async fn consume(&self, queue: &str, listener: ConsumeListener) -> Result<Disposable>;

    /// Adapt a channel subscription into a pull-style sequence.
    ///
    /// Every message delivered on the channel is buffered into an
    /// [`AsyncPool`]; the returned [`MessageSequence`] pulls them out in
    /// order. The sequence is lazy, infinite and non-restartable;
    /// producers never block, a slow consumer only accumulates buffered
    /// entries.
    async fn subscribe_sequence(&self, name: &str) -> Result<MessageSequence> {
        // ---
        let pool = Arc::new(AsyncPool::new());

        let feeder = {
            let pool = Arc::clone(&pool);
            subscriber(move |msg: Message| {
                let pool = Arc::clone(&pool);
                async move {
                    pool.release(msg);
                }
            })
        };

        let subscription = self.subscribe(name, None, feeder).await?;
        Ok(MessageSequence { pool, subscription })
    }
}

/// Lazy, infinite sequence of messages delivered on one channel.
///
/// Created by [`MessageQueue::subscribe_sequence`]. Dropping the sequence
/// (or calling [`dispose`](Self::dispose)) tears down the underlying
/// subscription; messages already buffered are discarded with it.
pub struct MessageSequence {
    pool: Arc<AsyncPool<Message>>,
    subscription: Disposable,
}

impl MessageSequence {
    /// Pull the next message, waiting for one if none is buffered.
    pub async fn next(&self) -> Result<Message> {
        self.pool.acquire().await
    }

    /// Number of delivered messages not yet pulled.
    pub fn buffered(&self) -> usize {
        self.pool.buffered()
    }

    /// Detach from the channel. Idempotent.
    pub fn dispose(&self) {
        self.subscription.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.subscription.is_disposed()
    }
}

impl Drop for MessageSequence {
    fn drop(&mut self) {
        self.subscription.dispose();
    }
}
