//! AMQP protocol backend.
//!
//! Maps the messaging contract onto exchange/queue primitives of an
//! AMQP 0-9-1 broker (RabbitMQ) via `lapin`.

mod lapin;

pub use lapin::AmqpBackend;
