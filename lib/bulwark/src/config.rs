//! Client configuration types.

use std::time::Duration;

use crate::pool::PoolConfig;

/// Configuration for the resilience pipeline client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total request timeout (whole exchange).
    pub timeout: Duration,
    /// Connection-establishment timeout, advisory to the transport.
    pub connect_timeout: Duration,
    /// Time-to-first-byte timeout, advisory to the transport.
    pub first_byte_timeout: Option<Duration>,
    /// Connection pool sizing.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            first_byte_timeout: None,
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    first_byte_timeout: Option<Duration>,
    pool: Option<PoolConfig>,
}

impl ClientConfigBuilder {
    /// Set the total request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the time-to-first-byte timeout.
    #[must_use]
    pub const fn first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.first_byte_timeout = Some(timeout);
        self
    }

    /// Set the connection pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            timeout: self.timeout.unwrap_or(defaults.timeout),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            first_byte_timeout: self.first_byte_timeout.or(defaults.first_byte_timeout),
            pool: self.pool.unwrap_or(defaults.pool),
        }
    }
}
