//! Backend-agnostic queue configuration.
//!
//! This type intentionally contains no broker-specific concepts; backends
//! are responsible for interpreting it into concrete connection settings.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, QueuePtr, Result};

/// Default interval between pending-task redelivery sweeps.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(2000);

/// Default deadline applied to RPC calls that do not pass their own.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Selects the concrete backend implementation.
///
/// Parsing an unknown driver name fails immediately, before any backend
/// is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// Single-process backend; deterministic, broker-free.
    Memory,
    /// AMQP 0-9-1 broker backend.
    Amqp,
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s {
            "memory" => Ok(Driver::Memory),
            "amqp" => Ok(Driver::Amqp),
            other => Err(Error::UnsupportedDriver(other.to_string())),
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        match self {
            Driver::Memory => f.write_str("memory"),
            Driver::Amqp => f.write_str("amqp"),
        }
    }
}

/// Connection parameters for a queue backend.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backend driver.
    pub driver: Driver,

    /// Broker URI (e.g. `"amqp://localhost:5672/%2f"`). Required for the
    /// AMQP driver, unused by the memory driver.
    pub uri: Option<String>,

    /// Interval between pending-task redelivery sweeps.
    pub retry_interval: Duration,

    /// Deadline applied to RPC calls that do not pass their own.
    pub rpc_timeout: Duration,
}

impl QueueConfig {
    /// Configuration for the in-process memory backend.
    pub fn memory() -> Self {
        // ---
        Self {
            driver: Driver::Memory,
            uri: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Configuration for the AMQP backend with the given broker URI.
    pub fn amqp(uri: impl Into<String>) -> Self {
        // ---
        Self {
            driver: Driver::Amqp,
            uri: Some(uri.into()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Override the pending-task retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Override the default RPC deadline.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Fluent builder for connecting a queue backend.
///
/// # Example
///
/// ```no_run
/// use taskbus::QueueBuilder;
///
/// # async fn example() -> taskbus::Result<()> {
/// let queue = QueueBuilder::new()
///     .driver("amqp")
///     .uri("amqp://localhost:5672/%2f")
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder {
    driver: Option<String>,
    uri: Option<String>,
    retry_interval: Duration,
    rpc_timeout: Duration,
}

impl QueueBuilder {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            driver: None,
            uri: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the backend driver name (`"memory"` or `"amqp"`).
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Set the broker URI (AMQP only).
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the pending-task retry interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the default RPC deadline.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Validate the builder into a [`QueueConfig`].
    ///
    /// # Errors
    ///
    /// - `Error::UnsupportedDriver` for a missing or unrecognized driver
    /// - `Error::InvalidArgument` when the AMQP driver has no URI
    pub fn build(self) -> Result<QueueConfig> {
        // ---
        let driver = self
            .driver
            .as_deref()
            .ok_or_else(|| Error::UnsupportedDriver("<none>".into()))?
            .parse::<Driver>()?;

        if driver == Driver::Amqp && self.uri.is_none() {
            return Err(Error::InvalidArgument(
                "the amqp driver requires a broker uri".into(),
            ));
        }

        Ok(QueueConfig {
            driver,
            uri: self.uri,
            retry_interval: self.retry_interval,
            rpc_timeout: self.rpc_timeout,
        })
    }

    /// Build the configuration and connect the backend (consumes self).
    pub async fn connect(self) -> Result<QueuePtr> {
        crate::connect(&self.build()?).await
    }
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_unknown_driver_fails_at_build() {
        // ---
        let result = QueueBuilder::new().driver("carrier-pigeon").build();
        assert!(matches!(result, Err(Error::UnsupportedDriver(name)) if name == "carrier-pigeon"));
    }

    #[test]
    fn test_missing_driver_fails_at_build() {
        // ---
        assert!(matches!(
            QueueBuilder::new().build(),
            Err(Error::UnsupportedDriver(_))
        ));
    }

    #[test]
    fn test_amqp_requires_uri() {
        // ---
        assert!(matches!(
            QueueBuilder::new().driver("amqp").build(),
            Err(Error::InvalidArgument(_))
        ));

        let config = QueueBuilder::new()
            .driver("amqp")
            .uri("amqp://localhost:5672/%2f")
            .build()
            .unwrap();
        assert_eq!(config.driver, Driver::Amqp);
    }

    #[test]
    fn test_memory_defaults() {
        // ---
        let config = QueueBuilder::new().driver("memory").build().unwrap();
        assert_eq!(config.driver, Driver::Memory);
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert_eq!(config.rpc_timeout, DEFAULT_RPC_TIMEOUT);
    }
}
