//! In-process backend.
//!
//! A pure single-process implementation of the messaging contract,
//! intended for local execution, testing, and as the reference for
//! contract semantics. Channel fan-out goes through a local
//! [`EventDispatcher`]; work queues live in a consumer table with a
//! per-queue round-robin cursor.
//!
//! ## Reference semantics
//!
//! - Once `subscribe()` returns, messages published afterwards on the
//!   matching `(name, topic)` channel are delivered; publishes with no
//!   subscriber are dropped (pub/sub is never buffered).
//! - A task sent to a queue with no consumer is buffered as pending and
//!   redelivered by a repeating sweep (default every 2 s) once a consumer
//!   appears. Retry is unbounded by design: a pending task survives until
//!   delivery or `disconnect()`.
//! - Channel dispatch and consumer selection are awaited inline, so both
//!   are totally ordered relative to a single caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{self, MissedTickBehavior};

use crate::domain::{channel_key, forward_subscriber, validate_name};
use crate::sync::{lock_ignore_poison, Deferred};
use crate::{
    //
    log_debug,
    log_warn,
    CompositeDisposable,
    ConsumeListener,
    Disposable,
    EventDispatcher,
    Error,
    Message,
    MessageQueue,
    QueueConfig,
    Result,
    SubscribeListener,
};

struct ConsumerEntry {
    id: u64,
    listener: ConsumeListener,
}

struct ConsumerGroup {
    entries: Vec<ConsumerEntry>,
    cursor: usize,
}

/// A task buffered because its queue had no consumer at send time.
///
/// `done` carries the completion handle of an RPC caller still waiting
/// for this task; a plain `send` leaves it empty.
struct PendingTask {
    queue: String,
    task: Value,
    done: Option<Deferred<Message>>,
}

struct QueueState {
    consumers: HashMap<String, ConsumerGroup>,
    pending: Vec<PendingTask>,
    next_consumer_id: u64,
}

type SharedState = Arc<Mutex<QueueState>>;

/// Select a queue's next consumer round-robin, advancing the cursor.
///
/// The index is always taken modulo the live consumer count, so it stays
/// in range even immediately after a consumer was removed.
fn select_listener(state: &mut QueueState, queue: &str) -> Option<ConsumeListener> {
    // ---
    let group = state.consumers.get_mut(queue)?;
    if group.entries.is_empty() {
        return None;
    }

    let index = group.cursor % group.entries.len();
    group.cursor = index + 1;
    Some(Arc::clone(&group.entries[index].listener))
}

/// Deliver one task to a selected consumer and settle its outcome.
///
/// RPC-style tasks complete their `done` handle; fire-and-forget tasks
/// that fail are pushed back onto the pending list for the next sweep.
async fn deliver(state: SharedState, listener: ConsumeListener, task: PendingTask) {
    // ---
    let PendingTask { queue, task, done } = task;

    let msg = match Message::from_payload(task.clone()) {
        Ok(msg) => msg,
        Err(err) => {
            if let Some(done) = done {
                done.reject(err);
            }
            return;
        }
    };

    let outcome = listener(msg).await;

    match (done, outcome) {
        (Some(done), Ok(Some(payload))) => match Message::from_payload(payload) {
            Ok(reply) => {
                let _ = done.resolve(reply);
            }
            Err(err) => {
                done.reject(err);
            }
        },
        (Some(done), Ok(None)) => {
            let _ = done.resolve(Message::new());
        }
        (Some(done), Err(err)) => {
            done.reject(Error::consumer_failure(err));
        }
        (None, Ok(_)) => {}
        (None, Err(_err)) => {
            log_warn!("task on queue '{queue}' failed, re-queueing: {_err}");
            let mut state = lock_ignore_poison(&state);
            state.pending.push(PendingTask {
                queue,
                task,
                done: None,
            });
        }
    }
}

/// One redelivery sweep over the pending list.
async fn redeliver_pending(state: &SharedState) {
    // ---
    let mut due = Vec::new();
    {
        let mut locked = lock_ignore_poison(state);
        let pending = std::mem::take(&mut locked.pending);

        for task in pending {
            if task.done.as_ref().is_some_and(Deferred::is_abandoned) {
                log_debug!("dropping abandoned rpc task for queue '{}'", task.queue);
                continue;
            }

            match select_listener(&mut locked, &task.queue) {
                Some(listener) => due.push((listener, task)),
                None => locked.pending.push(task),
            }
        }
    }

    for (listener, task) in due {
        deliver(Arc::clone(state), listener, task).await;
    }
}

/// Single-process implementation of the messaging contract.
pub struct MemoryBackend {
    channels: EventDispatcher<Message>,
    state: SharedState,
    resources: CompositeDisposable,
    disposed: AtomicBool,
    retry_started: AtomicBool,
    retry_interval: Duration,
    rpc_timeout: Duration,
}

impl MemoryBackend {
    // ---
    pub fn new(config: &QueueConfig) -> Self {
        // ---
        Self {
            channels: EventDispatcher::new(),
            state: Arc::new(Mutex::new(QueueState {
                consumers: HashMap::new(),
                pending: Vec::new(),
                next_consumer_id: 0,
            })),
            resources: CompositeDisposable::new(),
            disposed: AtomicBool::new(false),
            retry_started: AtomicBool::new(false),
            retry_interval: config.retry_interval,
            rpc_timeout: config.rpc_timeout,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        // ---
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageQueue for MemoryBackend {
    // ---
    /// Start the pending-task retry sweep. Idempotent.
    async fn connect(&self) -> Result<()> {
        // ---
        self.ensure_live()?;
        if self.retry_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let interval = self.retry_interval;

        let sweeper = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh task
            // waits a full interval before its first retry.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                redeliver_pending(&state).await;
            }
        });

        self.resources.add(Disposable::new(move || sweeper.abort()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // ---
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.resources.dispose_async().await;
        self.channels.dispose();

        let pending = {
            let mut state = lock_ignore_poison(&self.state);
            state.consumers.clear();
            std::mem::take(&mut state.pending)
        };
        for task in pending {
            if let Some(done) = task.done {
                done.reject(Error::Disposed);
            }
        }

        Ok(())
    }

    async fn publish(&self, name: &str, topic: Option<&str>, payload: Value) -> Result<()> {
        // ---
        self.ensure_live()?;
        validate_name(name)?;

        let msg = Message::from_payload(payload)?;
        self.channels.emit(&channel_key(name, topic), msg).await
    }

    async fn subscribe(
        &self,
        name: &str,
        topic: Option<&str>,
        listener: SubscribeListener,
    ) -> Result<Disposable> {
        // ---
        self.ensure_live()?;
        validate_name(name)?;

        let registration = self
            .channels
            .on(&channel_key(name, topic), forward_subscriber(listener))?;
        self.resources.add(registration.clone());
        Ok(registration)
    }

    async fn send(&self, queue: &str, task: Value) -> Result<()> {
        // ---
        self.ensure_live()?;
        validate_name(queue)?;

        let listener = {
            let mut state = lock_ignore_poison(&self.state);
            select_listener(&mut state, queue)
        };

        match listener {
            Some(listener) => {
                deliver(
                    Arc::clone(&self.state),
                    listener,
                    PendingTask {
                        queue: queue.to_string(),
                        task,
                        done: None,
                    },
                )
                .await;
            }
            None => {
                log_debug!("no consumer on queue '{queue}', buffering task");
                let mut state = lock_ignore_poison(&self.state);
                state.pending.push(PendingTask {
                    queue: queue.to_string(),
                    task,
                    done: None,
                });
            }
        }

        Ok(())
    }

    async fn rpc(&self, queue: &str, task: Value, timeout: Option<Duration>) -> Result<Message> {
        // ---
        self.ensure_live()?;
        validate_name(queue)?;
        let deadline = timeout.unwrap_or(self.rpc_timeout);

        let listener = {
            let mut state = lock_ignore_poison(&self.state);
            select_listener(&mut state, queue)
        };

        match listener {
            Some(listener) => {
                let msg = Message::from_payload(task)?;

                // Spawned so that a timeout abandons the invocation
                // without interrupting it; its result is simply discarded.
                let invocation = tokio::spawn(listener(msg));

                match time::timeout(deadline, invocation).await {
                    Err(_) => Err(Error::Timeout),
                    Ok(Err(join_err)) => {
                        Err(Error::Consumer(format!("consumer task failed: {join_err}")))
                    }
                    Ok(Ok(Ok(Some(payload)))) => Message::from_payload(payload),
                    Ok(Ok(Ok(None))) => Ok(Message::new()),
                    Ok(Ok(Err(err))) => Err(Error::consumer_failure(err)),
                }
            }
            None => {
                let done = Deferred::new();
                {
                    let mut state = lock_ignore_poison(&self.state);
                    state.pending.push(PendingTask {
                        queue: queue.to_string(),
                        task,
                        done: Some(done.clone()),
                    });
                }

                // An elapsed deadline leaves the pending entry abandoned;
                // the next sweep discards it.
                match time::timeout(deadline, done.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout),
                }
            }
        }
    }

    async fn consume(&self, queue: &str, listener: ConsumeListener) -> Result<Disposable> {
        // ---
        self.ensure_live()?;
        validate_name(queue)?;

        let id = {
            let mut state = lock_ignore_poison(&self.state);
            let id = state.next_consumer_id;
            state.next_consumer_id += 1;

            state
                .consumers
                .entry(queue.to_string())
                .or_insert_with(|| ConsumerGroup {
                    entries: Vec::new(),
                    cursor: 0,
                })
                .entries
                .push(ConsumerEntry { id, listener });
            id
        };

        let state = Arc::clone(&self.state);
        let queue_name = queue.to_string();
        let registration = Disposable::new(move || {
            // ---
            let mut state = lock_ignore_poison(&state);
            if let Some(group) = state.consumers.get_mut(&queue_name) {
                group.entries.retain(|entry| entry.id != id);
                if group.entries.is_empty() {
                    state.consumers.remove(&queue_name);
                }
            }
        });

        self.resources.add(registration.clone());
        Ok(registration)
    }
}
