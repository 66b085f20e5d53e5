//! Fetch relay: route HTTP fetches from a backend through a browser.
//!
//! A backend process (the *requester*) asks for a URL to be fetched. A
//! broker forwards the request to a browser extension (the *executor*),
//! which performs it inside a live browser context and sends the result
//! back. The backend thereby rides on the browser's cookie jar and TLS
//! fingerprint.
//!
//! # Architecture
//!
//! ```text
//! RelayClient ──{url,options,id}──► Broker ──{url,options,id}──► Executor
//!      ▲                              │                              │
//!      └────────{id,response}─────────┴─────────{id,response}────────┘
//! ```
//!
//! Key design principles:
//!
//! - The broker and each client run their state on a single task that
//!   consumes an event queue; timers post events back into that queue
//! - Every request id gets exactly one terminal outcome
//! - Dead peers are detected by ping/pong heartbeats and purged, failing
//!   their outstanding requests outward
//! - Requests are queued and retried while no executor is connected
//!
//! # Quick Start
//!
//! ```no_run
//! use fetch_relay::{Broker, BrokerConfig, ClientOptions, RelayClient, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::start(BrokerConfig::new().with_port(0)).await?;
//!     let url = broker.ws_url().unwrap_or_default();
//!
//!     let client = RelayClient::connect(url, ClientOptions::default())?;
//!     let response = client.fetch("https://example.com", json!({})).await?;
//!     println!("status: {:?}", response.status());
//!
//!     client.shutdown().await;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`broker`] | Broker event loop, registry and router |
//! | [`client`] | Requester client and cookie store |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`heartbeat`] | Ping/pong liveness state machine |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire frames |
//! | [`timer`] | Cancellable timers that post events |
//! | [`transport`] | WebSocket transport layer |

// ============================================================================
// Modules
// ============================================================================

/// Broker: connection registry, request router and event loop.
///
/// Use [`Broker::start`] to listen for requesters and executors.
pub mod broker;

/// Requester client.
///
/// Use [`RelayClient::connect`] to dial a broker.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Heartbeat health tracking shared by broker and client.
pub mod heartbeat;

/// Type-safe identifiers for connections and requests.
pub mod identifiers;

/// Wire frame types.
pub mod protocol;

/// Event-posting timers.
pub mod timer;

/// WebSocket transport layer.
///
/// Listener, connection event loop and client-side dialling.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Broker types
pub use broker::{Broker, BrokerConfig, BrokerHandle, BrokerStats};

// Client types
pub use client::{ClientOptions, ClientStatus, CookieStore, RelayClient};

// Error types
pub use error::{Error, Result};

// Heartbeat types
pub use heartbeat::{Health, HeartbeatConfig};

// Identifier types
pub use identifiers::{ConnectionId, RequestId};

// Protocol types
pub use protocol::{ClientType, Cookie, FetchOutcome, FetchRequest, FetchResponse, Frame};
