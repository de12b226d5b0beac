//! Backend implementations.
//!
//! This module provides the concrete implementations of the domain-level
//! [`MessageQueue`](crate::MessageQueue) contract. The broker backend is
//! hidden behind the `amqp` feature and exposed only through the
//! [`connect`](crate::connect) factory and its own constructor.
//!
//! Domain code must not depend on backend-specific types.

#[cfg(feature = "amqp")]
pub mod amqp;

mod memory;

pub use memory::MemoryBackend;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBackend;

use std::sync::Arc;

use crate::{Driver, QueueConfig, QueuePtr, Result};

/// Construct the backend selected by `config.driver` and ready it.
pub(crate) async fn connect(config: &QueueConfig) -> Result<QueuePtr> {
    // ---
    let queue: QueuePtr = match config.driver {
        Driver::Memory => Arc::new(MemoryBackend::new(config)),

        #[cfg(feature = "amqp")]
        Driver::Amqp => Arc::new(AmqpBackend::new(config)?),

        #[cfg(not(feature = "amqp"))]
        Driver::Amqp => {
            return Err(crate::Error::UnsupportedDriver(
                "amqp (feature disabled)".into(),
            ))
        }
    };

    queue.connect().await?;
    Ok(queue)
}
