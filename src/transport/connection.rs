//! WebSocket connection and event loop.
//!
//! A [`Connection`] owns one WebSocket stream. It spawns a tokio task that
//! handles:
//!
//! - Incoming text frames, forwarded as [`TransportEvent::Frame`]
//! - Outgoing text frames queued through [`FrameSink::send_text`]
//! - Shutdown requests
//!
//! When the loop ends for any reason a single [`TransportEvent::Closed`] is
//! emitted and the connection reports itself as not open.
//!
//! The same type serves accepted (broker side) and dialled (client side)
//! sockets; it is generic over the underlying byte stream.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::{FrameSink, TransportEvent};

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write one text frame.
    Send(String),
    /// Close the socket and stop.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a WebSocket connection.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Cleared when the event loop exits.
    open: Arc<AtomicBool>,
}

impl Connection {
    /// Wraps a WebSocket stream and spawns its event loop.
    ///
    /// Returns the handle plus the receiver of inbound events.
    pub fn spawn<S>(ws_stream: WebSocketStream<S>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            event_tx,
            Arc::clone(&open),
        ));

        (Self { command_tx, open }, event_rx)
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        open: Arc<AtomicBool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx.send(TransportEvent::Frame(text.to_string())).is_err() {
                                debug!("Event receiver dropped");
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Binary and protocol-level ping/pong carry nothing for us
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "Failed to write frame");
                                break;
                            }
                            trace!("Frame sent");
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        open.store(false, Ordering::SeqCst);
        let _ = event_tx.send(TransportEvent::Closed);

        debug!("Event loop terminated");
    }
}

impl FrameSink for Connection {
    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        self.command_tx
            .send(ConnectionCommand::Send(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.command_tx.is_closed()
    }

    fn close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }
}

// ============================================================================
// Tests
// ============================================================================
