//! Requester side of the relay.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RelayClient`] | `fetch()` through the broker, with queueing, retry and reconnect |
//! | [`ClientOptions`] | Timeouts, retry ceilings, heartbeat and backoff |
//! | [`ClientStatus`] | Link state and table sizes |
//! | [`CookieStore`] | Per-hostname cookie cache |

// ============================================================================
// Submodules
// ============================================================================

/// Per-hostname cookie cache.
pub mod cookies;

/// Client task and public handle.
pub mod core;

/// Client settings.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use cookies::CookieStore;
pub use core::{ClientStatus, RelayClient};
pub use options::ClientOptions;
