use thiserror::Error;

/// Errors surfaced by the messaging contract and its backends.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not be reached, or an in-flight connection
    /// attempt failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation attempted after the owning resource was disposed.
    #[error("already disposed")]
    Disposed,

    /// RPC deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// A consume listener failed while handling a task.
    #[error("consumer failed: {0}")]
    Consumer(String),

    /// Argument validation failure, raised synchronously before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker-level failure reported by the AMQP client.
    #[error("broker error: {0}")]
    Broker(String),

    /// Driver name not recognized at construction time.
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),
}

impl Error {
    /// Normalize a listener failure into a `Consumer` error without
    /// double-wrapping one that already is.
    pub(crate) fn consumer_failure(err: Error) -> Error {
        match err {
            Error::Consumer(_) => err,
            other => Error::Consumer(other.to_string()),
        }
    }
}

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;
