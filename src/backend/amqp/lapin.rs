//! AMQP backend implementation using `lapin`.
//!
//! This module maps the messaging contract onto the exchange/queue
//! primitives of an AMQP 0-9-1 broker. It follows an **actor-based
//! concurrency model**: a single background actor task owns the broker
//! connection and every lapin channel; all interaction with the client
//! library is serialized through it over a command channel. This keeps the
//! public contract (`Send + Sync`) while respecting the client's
//! connection semantics.
//!
//! ## Mapping
//!
//! - **Pub/sub** — each `(name, topic)` channel is a non-durable topic
//!   exchange `name` plus an exclusive server-named queue bound with
//!   routing pattern `topic`, consumed with auto-acknowledge (at-most-once,
//!   best-effort). Deliveries fan out through the local event dispatcher,
//!   so any number of local subscribers share one broker consumer.
//! - **Work queues** — a durable named queue on a dedicated lapin channel
//!   with prefetch 1 (serializes processing per channel). Tasks are
//!   published persistent. Consumers acknowledge manually; a failed task
//!   is acknowledged anyway — there is no automatic redelivery — and the
//!   failure travels back to an RPC caller as an error reply.
//! - **RPC** — one shared exclusive reply queue per connection, consumed
//!   auto-ack. Replies carry `<opaque-id>-<3-digit-status>` correlation
//!   ids and are re-emitted locally under the opaque id, where a one-shot
//!   listener completes the caller's deferred. The listener is swept when
//!   the deadline fires, so a late reply finds nobody and is dropped.
//!
//! ## Connection behavior
//!
//! The connection is established lazily by the first operation (or by
//! `connect()`), through a Closed → Connecting → Ready state machine.
//! Concurrent callers during Connecting wait on the same in-flight
//! attempt; a failed attempt rejects all of them with a connection error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::correlation::{encode_reply_id, parse_reply_id, STATUS_CONSUMER_ERROR, STATUS_OK};
use crate::dispatcher::event_listener;
use crate::domain::{channel_key, forward_subscriber, validate_name};
use crate::sync::{Deferred, Gate};
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    CompositeDisposable,
    ConsumeListener,
    CorrelationId,
    Disposable,
    EventDispatcher,
    Error,
    Message,
    MessageQueue,
    QueueConfig,
    Result,
    SubscribeListener,
};

/// A decoded reply delivered on the shared reply queue.
#[derive(Clone)]
struct ReplyEvent {
    status: u16,
    body: Bytes,
}

//
// Actor commands
//

enum Cmd {
    EnsureChannel {
        name: String,
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    PublishChannel {
        name: String,
        topic: String,
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<()>>,
    },
    SendTask {
        queue: String,
        payload: Vec<u8>,
        reply_to: Option<String>,
        correlation_id: Option<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        listener: ConsumeListener,
        resp: oneshot::Sender<Result<String>>,
    },
    Cancel {
        tag: String,
    },
    EnsureReplyQueue {
        resp: oneshot::Sender<Result<String>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the connection actor. Cheap to clone.
#[derive(Clone)]
struct Link {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl Link {
    // ---
    async fn dispatch<T>(
        &self,
        cmd: Cmd,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        // ---
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Broker("actor command channel closed".into()))?;

        rx.await
            .map_err(|_| Error::Broker("actor dropped command response".into()))?
    }

    async fn ensure_channel(&self, name: &str, topic: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Cmd::EnsureChannel {
                name: name.to_string(),
                topic: topic.to_string(),
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn publish_channel(&self, name: &str, topic: &str, payload: Vec<u8>) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Cmd::PublishChannel {
                name: name.to_string(),
                topic: topic.to_string(),
                payload,
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn send_task(
        &self,
        queue: &str,
        payload: Vec<u8>,
        reply_to: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Cmd::SendTask {
                queue: queue.to_string(),
                payload,
                reply_to,
                correlation_id,
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn consume(&self, queue: &str, listener: ConsumeListener) -> Result<String> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Cmd::Consume {
                queue: queue.to_string(),
                listener,
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn ensure_reply_queue(&self) -> Result<String> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(Cmd::EnsureReplyQueue { resp: tx }, rx).await
    }

    /// Cancel a consumer by tag from a synchronous context.
    fn cancel(&self, tag: String) {
        let _ = self.cmd_tx.try_send(Cmd::Cancel { tag });
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.dispatch(Cmd::Close { resp: tx }, rx).await
    }
}

//
// Connection state machine
//

enum ConnState {
    Closed,
    Connecting(Arc<Gate>),
    Ready(Link),
    Disconnecting,
}

/// Background actor task that owns the AMQP connection and channels.
struct Actor {
    connection: Connection,
    // Channel used for pub/sub exchanges and the shared reply queue.
    root: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    channels: EventDispatcher<Message>,
    replies: EventDispatcher<ReplyEvent>,
    // Declared pub/sub channels, keyed "<name>:<topic>".
    pubsub: HashMap<String, JoinHandle<()>>,
    // Work queue name → dedicated prefetch-1 channel.
    queues: HashMap<String, Channel>,
    // Consumer tag → the channel that owns it.
    consumers: HashMap<String, Channel>,
    consumer_tasks: Vec<JoinHandle<()>>,
    reply_queue: Option<String>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("amqp actor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle_cmd(cmd).await;
        }

        for (_, handle) in self.pubsub.drain() {
            handle.abort();
        }
        for handle in self.consumer_tasks.drain(..) {
            handle.abort();
        }

        let _ = self.root.close(200, "normal shutdown").await;
        let _ = self.connection.close(200, "normal shutdown").await;

        log_info!("amqp actor stopped");
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::EnsureChannel { name, topic, resp } => {
                let result = self.ensure_channel(&name, &topic).await;
                let _ = resp.send(result);
            }
            Cmd::PublishChannel {
                name,
                topic,
                payload,
                resp,
            } => {
                let result = self.publish_channel(&name, &topic, &payload).await;
                let _ = resp.send(result);
            }
            Cmd::SendTask {
                queue,
                payload,
                reply_to,
                correlation_id,
                resp,
            } => {
                let result = self
                    .send_task(&queue, &payload, reply_to, correlation_id)
                    .await;
                let _ = resp.send(result);
            }
            Cmd::Consume {
                queue,
                listener,
                resp,
            } => {
                let result = self.consume(&queue, listener).await;
                let _ = resp.send(result);
            }
            Cmd::Cancel { tag } => {
                if let Some(channel) = self.consumers.remove(&tag) {
                    if let Err(e) = channel
                        .basic_cancel(&tag, BasicCancelOptions::default())
                        .await
                    {
                        log_warn!("consumer cancel failed for tag {tag}: {e}");
                    }
                }
            }
            Cmd::EnsureReplyQueue { resp } => {
                let result = self.ensure_reply_queue().await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    /// Declare a pub/sub channel once per `(name, topic)` and start its
    /// broker consumer.
    async fn ensure_channel(&mut self, name: &str, topic: &str) -> Result<()> {
        // ---
        let key = format!("{name}:{topic}");
        if self.pubsub.contains_key(&key) {
            return Ok(());
        }

        self.root
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("exchange declare failed: {e}")))?;

        let queue = self
            .root
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("channel queue declare failed: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        self.root
            .queue_bind(
                &queue_name,
                name,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("queue bind failed: {e}")))?;

        let consumer = self
            .root
            .basic_consume(
                &queue_name,
                &format!("channel-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("channel consume failed: {e}")))?;

        log_info!("declared channel {key}");

        let dispatch_key = channel_key(
            name,
            if topic.is_empty() { None } else { Some(topic) },
        );
        let channels = self.channels.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("channel consumer error on {dispatch_key}: {e}");
                        break;
                    }
                };

                match Message::decode(&delivery.data) {
                    Ok(msg) => {
                        if let Err(_e) = channels.emit(&dispatch_key, msg).await {
                            log_warn!("channel listener failed on {dispatch_key}: {_e}");
                        }
                    }
                    Err(e) => log_error!("undecodable message on {dispatch_key}: {e}"),
                }
            }
        });

        self.pubsub.insert(key, handle);
        Ok(())
    }

    async fn publish_channel(&mut self, name: &str, topic: &str, payload: &[u8]) -> Result<()> {
        // ---
        self.ensure_channel(name, topic).await?;

        self.root
            .basic_publish(
                name,
                topic,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("channel publish failed: {e}")))?;

        log_debug!("published on channel {name}:{topic}");
        Ok(())
    }

    /// Open (once) the dedicated prefetch-1 channel for a work queue.
    async fn ensure_queue(&mut self, name: &str) -> Result<Channel> {
        // ---
        if let Some(channel) = self.queues.get(name) {
            return Ok(channel.clone());
        }

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::Broker(format!("queue channel open failed: {e}")))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("qos failed: {e}")))?;

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("queue declare failed: {e}")))?;

        log_info!("declared work queue {name}");

        self.queues.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    async fn send_task(
        &mut self,
        queue: &str,
        payload: &[u8],
        reply_to: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        // ---
        let channel = self.ensure_queue(queue).await?;

        // delivery_mode 2 = persistent
        let mut properties = BasicProperties::default().with_delivery_mode(2);
        if let Some(reply_to) = reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| Error::Broker(format!("task publish failed: {e}")))?;

        log_debug!("sent task to queue {queue}");
        Ok(())
    }

    async fn consume(&mut self, queue: &str, listener: ConsumeListener) -> Result<String> {
        // ---
        let channel = self.ensure_queue(queue).await?;
        let tag = format!("{queue}-{}", Uuid::new_v4());

        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("consume failed: {e}")))?;

        log_info!("consuming queue {queue} (tag {tag})");

        let task_channel = channel.clone();
        let task_tag = tag.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("[{task_tag}] consumer error: {e}");
                        break;
                    }
                };

                let reply_to = delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|s| s.as_str().to_string());
                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string());

                let outcome = match Message::decode(&delivery.data) {
                    Ok(msg) => listener(msg).await,
                    Err(e) => Err(e),
                };

                // Failed tasks are acknowledged too: the queue offers no
                // automatic redelivery, the failure travels back as a reply.
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    log_error!("[{task_tag}] ack failed: {e}");
                    continue;
                }

                let Some(reply_to) = reply_to else {
                    if let Err(_e) = &outcome {
                        log_warn!("[{task_tag}] task failed with no reply address: {_e}");
                    }
                    continue;
                };
                let Some(correlation_id) = correlation_id else {
                    log_warn!("[{task_tag}] reply address without correlation id, dropping");
                    continue;
                };

                let (reply_id, body) = match outcome {
                    Ok(payload) => {
                        let reply = match payload {
                            Some(value) => Message::from_payload(value),
                            None => Ok(Message::new()),
                        };
                        match reply.and_then(|msg| msg.encode()) {
                            Ok(body) => (encode_reply_id(&correlation_id, STATUS_OK), body),
                            Err(e) => (
                                encode_reply_id(&correlation_id, STATUS_CONSUMER_ERROR),
                                e.to_string().into_bytes(),
                            ),
                        }
                    }
                    Err(e) => (
                        encode_reply_id(&correlation_id, STATUS_CONSUMER_ERROR),
                        e.to_string().into_bytes(),
                    ),
                };

                let properties = BasicProperties::default().with_correlation_id(reply_id.into());
                if let Err(e) = task_channel
                    .basic_publish(
                        "",
                        &reply_to,
                        BasicPublishOptions::default(),
                        &body,
                        properties,
                    )
                    .await
                {
                    log_error!("[{task_tag}] reply publish failed: {e}");
                }
            }

            log_info!("[{task_tag}] consumer task ended");
        });

        self.consumers.insert(tag.clone(), channel);
        self.consumer_tasks.push(handle);
        Ok(tag)
    }

    /// Declare (once per connection) the shared reply queue and start the
    /// multiplexing consumer.
    async fn ensure_reply_queue(&mut self) -> Result<String> {
        // ---
        if let Some(name) = &self.reply_queue {
            return Ok(name.clone());
        }

        let queue = self
            .root
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("reply queue declare failed: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        let consumer = self
            .root
            .basic_consume(
                &queue_name,
                &format!("reply-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("reply consume failed: {e}")))?;

        log_info!("reply queue ready: {queue_name}");

        let replies = self.replies.clone();
        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let mut delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("reply consumer error: {e}");
                        break;
                    }
                };

                let Some(raw) = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string())
                else {
                    log_warn!("reply without correlation id, dropping");
                    continue;
                };

                match parse_reply_id(&raw) {
                    Ok((opaque_id, status)) => {
                        let event = ReplyEvent {
                            status,
                            body: Bytes::from(std::mem::take(&mut delivery.data)),
                        };
                        // A swept (timed-out) rpc has no listener left;
                        // the late reply is dropped here.
                        if let Err(_e) = replies.emit(&opaque_id, event).await {
                            log_warn!("reply listener failed for {opaque_id}: {_e}");
                        }
                    }
                    Err(_) => log_warn!("unparseable reply correlation id: {raw}"),
                }
            }
        });

        self.consumer_tasks.push(handle);
        self.reply_queue = Some(queue_name.clone());
        Ok(queue_name)
    }
}

/// AMQP implementation of the messaging contract.
pub struct AmqpBackend {
    uri: String,
    state: Mutex<ConnState>,
    channels: EventDispatcher<Message>,
    replies: EventDispatcher<ReplyEvent>,
    resources: CompositeDisposable,
    disposed: AtomicBool,
    rpc_timeout: Duration,
}

impl AmqpBackend {
    // ---
    /// Create an unconnected backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` when the configuration carries no
    /// broker URI.
    pub fn new(config: &QueueConfig) -> Result<Self> {
        // ---
        let uri = config
            .uri
            .clone()
            .ok_or_else(|| Error::InvalidArgument("amqp backend requires a broker uri".into()))?;

        Ok(Self {
            uri,
            state: Mutex::new(ConnState::Closed),
            channels: EventDispatcher::new(),
            replies: EventDispatcher::new(),
            resources: CompositeDisposable::new(),
            disposed: AtomicBool::new(false),
            rpc_timeout: config.rpc_timeout,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        // ---
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Resolve the actor link, connecting lazily and idempotently.
    ///
    /// Concurrent callers during an in-flight attempt park on its gate and
    /// share its outcome.
    async fn get_connection(&self) -> Result<Link> {
        // ---
        let mut state = self.state.lock().await;
        let in_flight = match &*state {
            ConnState::Ready(link) => return Ok(link.clone()),
            ConnState::Disconnecting => return Err(Error::Disposed),
            ConnState::Connecting(gate) => Some(Arc::clone(gate)),
            ConnState::Closed => None,
        };

        match in_flight {
            // Another caller owns the attempt; park on its gate and share
            // the outcome.
            Some(gate) => {
                drop(state);
                gate.wait().await?;

                let state = self.state.lock().await;
                match &*state {
                    ConnState::Ready(link) => Ok(link.clone()),
                    _ => Err(Error::Connection(
                        "broker connection attempt failed".into(),
                    )),
                }
            }
            // This caller owns the attempt.
            None => {
                let gate = Arc::new(Gate::new());
                *state = ConnState::Connecting(Arc::clone(&gate));
                drop(state);
                self.establish(gate).await
            }
        }
    }

    /// Drive the single in-flight connection attempt.
    async fn establish(&self, gate: Arc<Gate>) -> Result<Link> {
        // ---
        let result = self.open_link().await;

        {
            let mut state = self.state.lock().await;
            *state = match &result {
                Ok(link) => ConnState::Ready(link.clone()),
                Err(_) => ConnState::Closed,
            };
        }
        gate.open();

        result
    }

    async fn open_link(&self) -> Result<Link> {
        // ---
        log_info!("connecting to AMQP broker: {}", self.uri);

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("broker connect failed: {e}");
                log_error!("{msg}");
                Error::Connection(msg)
            })?;

        let root = connection.create_channel().await.map_err(|e| {
            let msg = format!("channel open failed: {e}");
            log_error!("{msg}");
            Error::Connection(msg)
        })?;

        log_info!("connected to AMQP broker");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let actor = Actor {
            connection,
            root,
            cmd_rx,
            channels: self.channels.clone(),
            replies: self.replies.clone(),
            pubsub: HashMap::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            consumer_tasks: Vec::new(),
            reply_queue: None,
        };
        tokio::spawn(actor.run());

        Ok(Link { cmd_tx })
    }
}

#[async_trait::async_trait]
impl MessageQueue for AmqpBackend {
    // ---
    async fn connect(&self) -> Result<()> {
        // ---
        self.ensure_live()?;
        self.get_connection().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        // ---
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let link = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ConnState::Disconnecting) {
                ConnState::Ready(link) => Some(link),
                ConnState::Connecting(gate) => {
                    gate.open();
                    None
                }
                _ => None,
            }
        };

        // Children first: cancel consumers and local registrations while
        // the actor can still process the commands, then stop the actor.
        self.resources.dispose_async().await;
        if let Some(link) = link {
            let _ = link.close().await;
        }

        self.channels.dispose();
        self.replies.dispose();

        let mut state = self.state.lock().await;
        *state = ConnState::Closed;
        Ok(())
    }

    async fn publish(&self, name: &str, topic: Option<&str>, payload: Value) -> Result<()> {
        // ---
        self.ensure_live()?;
        validate_name(name)?;

        let body = Message::from_payload(payload)?.encode()?;
        let link = self.get_connection().await?;
        link.publish_channel(name, topic.unwrap_or(""), body).await
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

        let link = self.get_connection().await?;
        link.ensure_channel(name, topic.unwrap_or("")).await?;

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

        let body = Message::from_payload(task)?.encode()?;
        let link = self.get_connection().await?;
        link.send_task(queue, body, None, None).await
    }

    async fn rpc(&self, queue: &str, task: Value, timeout: Option<Duration>) -> Result<Message> {
        // ---
        self.ensure_live()?;
        validate_name(queue)?;
        let deadline = timeout.unwrap_or(self.rpc_timeout);

        let body = Message::from_payload(task)?.encode()?;
        let link = self.get_connection().await?;
        let reply_queue = link.ensure_reply_queue().await?;

        let id = CorrelationId::generate();
        let done: Deferred<Message> = Deferred::new();

        let completion = {
            let done = done.clone();
            event_listener(move |event: ReplyEvent| {
                let done = done.clone();
                async move {
                    if event.status == STATUS_CONSUMER_ERROR {
                        done.reject(Error::Consumer(
                            String::from_utf8_lossy(&event.body).into_owned(),
                        ));
                    } else {
                        match Message::decode(&event.body) {
                            Ok(msg) => {
                                let _ = done.resolve(msg);
                            }
                            Err(e) => {
                                done.reject(e);
                            }
                        }
                    }
                    Ok(Value::Null)
                }
            })
        };

        let registration = self.replies.once(id.as_str(), completion)?;

        link.send_task(queue, body, Some(reply_queue), Some(id.to_string()))
            .await?;

        match time::timeout(deadline, done.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Sweep the correlation entry so a late reply cannot
                // resurrect a settled handler.
                registration.dispose();
                Err(Error::Timeout)
            }
        }
    }

    async fn consume(&self, queue: &str, listener: ConsumeListener) -> Result<Disposable> {
        // ---
        self.ensure_live()?;
        validate_name(queue)?;

        let link = self.get_connection().await?;
        let tag = link.consume(queue, listener).await?;

        let registration = Disposable::new({
            let link = link.clone();
            move || link.cancel(tag)
        });
        self.resources.add(registration.clone());
        Ok(registration)
    }
}
