//! Requester client options.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use fetch_relay::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .with_timeout(Duration::from_secs(10))
//!     .with_max_retries(2)
//!     .with_queue_check_interval(Duration::from_millis(500));
//!
//! assert!(options.validate().is_ok());
//! assert_eq!(options.reconnect_delay(3), Duration::from_secs(3));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;

// ============================================================================
// Constants
// ============================================================================

/// Highest multiplier applied to the reconnect base delay.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 5;

// ============================================================================
// ClientOptions
// ============================================================================

/// Requester client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Per-attempt response timeout, and give-up time for queued calls.
    pub timeout: Duration,

    /// Retries per call after the first attempt.
    pub max_retries: u32,

    /// Heartbeat towards the broker.
    pub heartbeat: HeartbeatConfig,

    /// Period of the outbound queue drain.
    pub queue_check_interval: Duration,

    /// Reconnect delay for the first attempt.
    pub reconnect_base_delay: Duration,

    /// Reconnect attempts before the client stops trying on its own.
    pub max_reconnect_attempts: u32,

    /// Delay before retrying a call whose frame could not be written.
    pub send_retry_delay: Duration,

    /// Time to wait for `identified` after each handshake.
    pub identify_timeout: Duration,

    /// Handshakes sent before identification is declared failed.
    pub identify_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            heartbeat: HeartbeatConfig::default(),
            queue_check_interval: Duration::from_secs(1),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            send_retry_delay: Duration::from_secs(1),
            identify_timeout: Duration::from_secs(5),
            identify_attempts: 3,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt and give-up timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry ceiling.
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
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

    /// Sets how many missed pongs drop the link.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_max_missed(mut self, max_missed: u32) -> Self {
        self.heartbeat.max_missed = max_missed;
        self
    }

    /// Sets the queue drain period.
    #[inline]
    #[must_use]
    pub fn with_queue_check_interval(mut self, interval: Duration) -> Self {
        self.queue_check_interval = interval;
        self
    }

    /// Sets the reconnect base delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Sets the reconnect attempt ceiling.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the delay before retrying a failed write.
    #[inline]
    #[must_use]
    pub fn with_send_retry_delay(mut self, delay: Duration) -> Self {
        self.send_retry_delay = delay;
        self
    }

    /// Sets the per-handshake identification timeout.
    #[inline]
    #[must_use]
    pub fn with_identify_timeout(mut self, timeout: Duration) -> Self {
        self.identify_timeout = timeout;
        self
    }

    /// Sets how many handshakes are attempted.
    #[inline]
    #[must_use]
    pub fn with_identify_attempts(mut self, attempts: u32) -> Self {
        self.identify_attempts = attempts;
        self
    }
}

// ============================================================================
// Accessors & Validation
// ============================================================================

impl ClientOptions {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `reconnect_base_delay * min(attempt, 5)`.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay * attempt.clamp(1, MAX_BACKOFF_MULTIPLIER)
    }

    /// Per-attempt timeout in milliseconds, for error messages.
    #[inline]
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Checks the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a period is zero, the heartbeat settings
    /// are inconsistent, or no identification attempt is allowed.
    pub fn validate(&self) -> Result<()> {
        self.heartbeat.validate()?;

        let periods = [
            ("timeout", self.timeout),
            ("queue_check_interval", self.queue_check_interval),
            ("reconnect_base_delay", self.reconnect_base_delay),
            ("send_retry_delay", self.send_retry_delay),
            ("identify_timeout", self.identify_timeout),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("{name} must be non-zero")));
        }

        if self.identify_attempts == 0 {
            return Err(Error::config("identify_attempts must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
