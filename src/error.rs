//! Error types for the fetch relay.
//!
//! This module defines all error types used throughout the crate, on both
//! the broker side and the requester side.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use fetch_relay::{Result, RelayClient};
//!
//! async fn example(client: &RelayClient) -> Result<()> {
//!     let response = client.fetch("https://example.com", Default::default()).await?;
//!     println!("{}", response.status().unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::IdentificationFailed`] |
//! | Protocol | [`Error::Protocol`], [`Error::UnexpectedServerCondition`] |
//! | Routing | [`Error::NoExecutorAvailable`], [`Error::DispatchFailed`], [`Error::Remote`] |
//! | Retry | [`Error::RequestTimeout`], [`Error::MaxRetriesExceeded`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// The `Display` form of routing errors is what the broker writes into the
/// `error` field of a `{id, error}` frame, so requesters see the same text.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when broker or client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out while establishing a connection.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while a call was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The broker never acknowledged the identification handshake.
    #[error("Identification with broker failed after {attempts} attempts")]
    IdentificationFailed {
        /// Number of identification attempts made.
        attempts: u32,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or malformed frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// A frame arrived that is valid JSON but makes no sense in context.
    #[error("Unexpected server condition: {message}")]
    UnexpectedServerCondition {
        /// Description of what was received.
        message: String,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// The broker gave up waiting for an executor to connect.
    #[error("No extension clients available after maximum retries")]
    NoExecutorAvailable,

    /// The broker selected an executor but could not write to it.
    #[error("Failed to dispatch request to extension client: {message}")]
    DispatchFailed {
        /// Underlying channel error.
        message: String,
    },

    /// Error reported by the remote end in an `{id, error}` frame.
    #[error("{message}")]
    Remote {
        /// Error text as received.
        message: String,
    },

    // ========================================================================
    // Retry Errors
    // ========================================================================
    /// A queued call waited longer than the request timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    RequestTimeout {
        /// Description of what was being waited for.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Every attempt of a call timed out or failed to send.
    #[error("Max retries reached after {attempts} attempts")]
    MaxRetriesExceeded {
        /// Total number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unexpected server condition error.
    #[inline]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedServerCondition {
            message: message.into(),
        }
    }

    /// Creates a dispatch failure error.
    #[inline]
    pub fn dispatch_failed(message: impl Into<String>) -> Self {
        Self::DispatchFailed {
            message: message.into(),
        }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Rebuilds an error from the text of an `{id, error}` frame.
    ///
    /// The broker writes its own failures as their display text; those map
    /// back to their variants. Anything else came from an executor and
    /// becomes [`Error::Remote`].
    #[must_use]
    pub fn from_wire(message: impl Into<String>) -> Self {
        let message = message.into();
        if message == Self::NoExecutorAvailable.to_string() {
            return Self::NoExecutorAvailable;
        }
        if message == Self::ConnectionClosed.to_string() {
            return Self::ConnectionClosed;
        }
        let dispatch_prefix = Self::dispatch_failed("").to_string();
        if let Some(detail) = message.strip_prefix(dispatch_prefix.as_str()) {
            return Self::dispatch_failed(detail);
        }
        Self::remote(message)
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a max retries error.
    #[inline]
    pub fn max_retries(attempts: u32) -> Self {
        Self::MaxRetriesExceeded { attempts }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::MaxRetriesExceeded { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::IdentificationFailed { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed if the caller submits a fresh request.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::RequestTimeout { .. }
                | Self::MaxRetriesExceeded { .. }
                | Self::NoExecutorAvailable
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
