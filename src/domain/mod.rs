//! Domain layer public interface.
//!
//! This module defines the backend-agnostic messaging contract. It
//! intentionally avoids any reference to concrete brokers or client
//! libraries; concrete implementations live under `src/backend/`.

mod queue;

// --- Messaging contract re-exports ---

pub use queue::{
    //
    consumer,
    subscriber,
    ConsumeListener,
    MessageQueue,
    MessageSequence,
    QueuePtr,
    SubscribeListener,
};

pub(crate) use queue::{channel_key, forward_subscriber, validate_name};
