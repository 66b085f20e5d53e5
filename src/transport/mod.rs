//! WebSocket transport layer.
//!
//! This module carries discrete text frames between a peer and the broker.
//! Everything above it talks to the transport through the [`FrameSink`]
//! trait and a stream of [`TransportEvent`]s, so the broker and client state
//! machines never touch a socket directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐                         ┌──────────────┐                         ┌──────────────┐
//! │  Requester   │        WebSocket        │    Broker    │        WebSocket        │   Executor   │
//! │  RelayClient │◄───────────────────────►│ RelayServer  │◄───────────────────────►│  (extension) │
//! │  WsConnector │                         │ → Connection │                         │              │
//! └──────────────┘                         └──────────────┘                         └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | WebSocket connection and event loop |
//! | `connector` | Client-side dialling |
//! | `server` | Listener and accept loop |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and event loop.
pub mod connection;

/// Client-side connection establishment.
pub mod connector;

/// WebSocket listener for the broker.
pub mod server;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use connector::{Connector, TransportLink, WsConnector};
pub use server::RelayServer;

// ============================================================================
// Imports
// ============================================================================

use crate::error::Result;
use crate::protocol::Frame;

// ============================================================================
// TransportEvent
// ============================================================================

/// Inbound event from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame, unparsed.
    Frame(String),
    /// The transport is gone. Emitted once, last.
    Closed,
}

// ============================================================================
// FrameSink
// ============================================================================

/// Outbound half of a transport.
///
/// Sends are non-blocking: a successful return means the frame was queued
/// for writing, and an error means the channel is already known to be dead.
pub trait FrameSink: Send + Sync {
    /// Queues a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConnectionClosed`] if the transport is closed.
    fn send_text(&self, text: String) -> Result<()>;

    /// Returns `true` while the transport accepts frames.
    fn is_open(&self) -> bool;

    /// Requests the transport to close. Idempotent.
    fn close(&self);

    /// Serializes and queues a frame.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Json`] if serialization fails
    /// - [`crate::Error::ConnectionClosed`] if the transport is closed
    fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_text(frame.to_text()?)
    }
}
