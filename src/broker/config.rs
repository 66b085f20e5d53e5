//! Broker configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use fetch_relay::BrokerConfig;
//!
//! let config = BrokerConfig::new()
//!     .with_port(9222)
//!     .with_heartbeat_interval(Duration::from_secs(15))
//!     .with_queue_retry_delay(Duration::from_secs(1));
//!
//! assert!(config.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;

// ============================================================================
// Constants
// ============================================================================

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Delay between executor-selection retries for a queued request.
const DEFAULT_QUEUE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Selection retries before a queued request fails.
const DEFAULT_QUEUE_MAX_RETRIES: u32 = 3;

/// Time an accepted socket has to send its handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the stats log line.
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// BrokerConfig
// ============================================================================

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Address to listen on.
    pub host: IpAddr,

    /// Port to listen on (0 for random).
    pub port: u16,

    /// Heartbeat cadence applied to every identified peer.
    pub heartbeat: HeartbeatConfig,

    /// Period of the stats report. `None` disables it.
    pub stats_interval: Option<Duration>,

    /// Delay between executor-selection retries.
    pub queue_retry_delay: Duration,

    /// Selection retries before `NoExecutorAvailable`.
    pub queue_max_retries: u32,

    /// Time an accepted socket has to identify before it is closed.
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            heartbeat: HeartbeatConfig::default(),
            stats_interval: Some(DEFAULT_STATS_INTERVAL),
            queue_retry_delay: DEFAULT_QUEUE_RETRY_DELAY,
            queue_max_retries: DEFAULT_QUEUE_MAX_RETRIES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl BrokerConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Sets the listen port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the ping interval.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.interval = interval;
        self
    }

    /// Sets the pong timeout.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat.timeout = timeout;
        self
    }

    /// Sets how many consecutive misses terminate a peer.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_max_missed(mut self, max_missed: u32) -> Self {
        self.heartbeat.max_missed = max_missed;
        self
    }

    /// Sets the stats report period. `None` disables the report.
    #[inline]
    #[must_use]
    pub fn with_stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Sets the delay between executor-selection retries.
    #[inline]
    #[must_use]
    pub fn with_queue_retry_delay(mut self, delay: Duration) -> Self {
        self.queue_retry_delay = delay;
        self
    }

    /// Sets the number of executor-selection retries.
    #[inline]
    #[must_use]
    pub fn with_queue_max_retries(mut self, retries: u32) -> Self {
        self.queue_max_retries = retries;
        self
    }

    /// Sets how long an unidentified socket is kept open.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

// ============================================================================
// Accessors & Validation
// ============================================================================

impl BrokerConfig {
    /// Returns the socket address to bind.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid heartbeat settings or when the
    /// retry delay, handshake timeout or stats interval is zero.
    pub fn validate(&self) -> Result<()> {
        self.heartbeat.validate()?;

        if self.queue_retry_delay.is_zero() {
            return Err(Error::config("queue retry delay must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("handshake timeout must be non-zero"));
        }
        if self.stats_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::config(
                "stats interval must be non-zero (use None to disable)",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
