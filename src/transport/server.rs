//! WebSocket listener for the broker.
//!
//! # Connection Flow
//!
//! 1. Broker binds to the configured address (port 0 for a random port)
//! 2. Requesters and executors dial `ws://host:port`
//! 3. Each TCP connection is upgraded to WebSocket on its own task
//! 4. The resulting [`Connection`] is handed to the broker's callback

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::{Connection, TransportEvent};

// ============================================================================
// Types
// ============================================================================

/// Called once per upgraded connection.
pub type ConnectionCallback =
    Arc<dyn Fn(Connection, mpsc::UnboundedReceiver<TransportEvent>, SocketAddr) + Send + Sync>;

// ============================================================================
// RelayServer
// ============================================================================

/// A bound WebSocket listener that has not started accepting yet.
///
/// # Example
///
/// ```ignore
/// use std::net::{Ipv4Addr, SocketAddr};
/// use fetch_relay::transport::RelayServer;
///
/// let server = RelayServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
/// println!("listening on {}", server.ws_url());
/// ```
pub struct RelayServer {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the server is bound to.
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Binds to the specified address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "WebSocket server bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Accepts connections until `shutdown` flips to `true` or its sender
    /// is dropped.
    pub async fn serve(self, on_connection: ConnectionCallback, mut shutdown: watch::Receiver<bool>) {
        info!(port = self.port(), "Accept loop started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let on_connection = Arc::clone(&on_connection);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, addr, on_connection).await {
                                    warn!(error = %e, %addr, "Connection handling failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades a single TCP connection and hands it over.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        on_connection: ConnectionCallback,
    ) -> Result<()> {
        debug!(%addr, "New TCP connection");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        debug!(%addr, "WebSocket connection established");

        let (connection, events) = Connection::spawn(ws_stream);
        on_connection(connection, events, addr);

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
