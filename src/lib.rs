//! Uniform asynchronous messaging with interchangeable backends.
//!
//! This library offers one contract for three interaction patterns —
//! broadcast publish/subscribe, load-balanced work queues, and
//! request/reply (RPC) over a queue — behind which either a single-process
//! in-memory backend or an AMQP broker backend is active. Callers never
//! learn which.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use taskbus::{consumer, MessageQueue, QueueBuilder};
//!
//! # async fn example() -> taskbus::Result<()> {
//! let queue = QueueBuilder::new().driver("memory").connect().await?;
//!
//! queue
//!     .consume(
//!         "images",
//!         consumer(|msg| async move {
//!             Ok(Some(json!({ "echoed": msg.get("src").cloned() })))
//!         }),
//!     )
//!     .await?;
//!
//! let reply = queue
//!     .rpc("images", json!({ "src": "cat.png" }), None)
//!     .await?;
//! assert!(reply.get("echoed").is_some());
//!
//! queue.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod backend;
mod config;
mod correlation;
mod disposable;
mod dispatcher;
mod domain;
mod error;
mod macros;
mod message;
mod sync;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use backend::MemoryBackend;

#[cfg(feature = "amqp")]
pub use backend::AmqpBackend;

pub use config::{
    //
    Driver,
    QueueBuilder,
    QueueConfig,
    DEFAULT_RETRY_INTERVAL,
    DEFAULT_RPC_TIMEOUT,
};

pub use correlation::{
    //
    encode_reply_id,
    parse_reply_id,
    CorrelationId,
    STATUS_CONSUMER_ERROR,
    STATUS_OK,
};

pub use disposable::{CompositeDisposable, Disposable};
pub use dispatcher::{
    //
    event_listener,
    EventDispatcher,
    EventListener,
    EventMatcher,
    ExactMatcher,
    ListenerResult,
    RegexMatcher,
};
pub use error::{Error, Result};
pub use message::Message;
pub use sync::{AsyncPool, Deferred, Gate};

pub use domain::{
    //
    consumer,
    subscriber,
    ConsumeListener,
    MessageQueue,
    MessageSequence,
    QueuePtr,
    SubscribeListener,
};

/// Connect the backend selected by the configuration's driver.
///
/// The returned queue is ready for use.
///
/// # Errors
///
/// - `Error::UnsupportedDriver` when the driver is not compiled in
/// - `Error::Connection` when the transport cannot be reached
pub async fn connect(config: &QueueConfig) -> Result<QueuePtr> {
    backend::connect(config).await
}
