//! WebSocket protocol message types.
//!
//! This module defines the frames exchanged between requesters, the broker
//! and executors.
//!
//! # Protocol Overview
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `{type:"identify"}` | Broker → Peer | Handshake prompt |
//! | `{clientType, instanceId?, ...}` | Peer → Broker | Handshake response |
//! | `{type:"identified"}` | Broker → Peer | Handshake ack |
//! | `{type:"extensionAvailable"\|"extensionUnavailable"}` | Broker → Requester | Pool availability |
//! | `{type:"ping"\|"pong", timestamp}` | Either | Heartbeat |
//! | `{url, options, id}` | Requester → Broker → Executor | Fetch submission |
//! | `{id, response\|error}` | Executor → Broker → Requester | Fetch outcome |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `fetch` | Fetch request/outcome payloads and cookies |
//! | `frame` | Frame classification and control messages |

// ============================================================================
// Submodules
// ============================================================================

/// Fetch request, outcome and cookie types.
pub mod fetch;

/// Frame enum and control messages.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use fetch::{Cookie, FetchOutcome, FetchRequest, FetchResponse, wants_cookiejar};
pub use frame::{ClientType, Control, Frame, Hello, INSTANCE_ID_FIELD, instance_id, now_millis};
