//! Client-side connection establishment.
//!
//! The requester client reconnects repeatedly over its lifetime, so dialling
//! sits behind the [`Connector`] trait. [`WsConnector`] is the production
//! implementation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};

use super::{Connection, FrameSink, TransportEvent};

// ============================================================================
// Constants
// ============================================================================

/// Default limit for the TCP connect plus WebSocket upgrade.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// TransportLink
// ============================================================================

/// An established transport: the outbound sink plus inbound events.
pub struct TransportLink {
    /// Outbound half.
    pub sink: Arc<dyn FrameSink>,
    /// Inbound frames, terminated by [`TransportEvent::Closed`].
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

// ============================================================================
// Connector
// ============================================================================

/// Opens a new transport to the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dials the broker.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the broker cannot be reached.
    async fn connect(&self) -> Result<TransportLink>;
}

// ============================================================================
// WsConnector
// ============================================================================

/// Dials a `ws://` URL with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Broker URL.
    url: String,
    /// Limit for a single dial.
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for the given broker URL.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the dial timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the broker URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink> {
        let (ws_stream, _) = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| Error::connection_timeout(self.connect_timeout.as_millis() as u64))?
        .map_err(|e| Error::connection(format!("{}: {e}", self.url)))?;

        debug!(url = %self.url, "WebSocket connection established");

        let (connection, events) = Connection::spawn(ws_stream);
        Ok(TransportLink {
            sink: Arc::new(connection),
            events,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
