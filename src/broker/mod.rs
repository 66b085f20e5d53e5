//! Broker: the process between requesters and executors.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Broker`] | Starts the listener and event loop |
//! | [`BrokerHandle`] | Stats, attach and shutdown for a running broker |
//! | [`BrokerConfig`] | Listen address, heartbeat and retry settings |
//! | [`Registry`] | Identified peers partitioned by role |
//! | [`Router`] | In-flight and queued request tables |
//!
//! # Example
//!
//! ```no_run
//! use fetch_relay::{Broker, BrokerConfig, Result};
//!
//! # async fn example() -> Result<()> {
//! let broker = Broker::start(BrokerConfig::new().with_port(8080)).await?;
//!
//! let stats = broker.stats().await?;
//! println!("{} executors connected", stats.executors);
//!
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Broker settings.
pub mod config;

/// Event loop, public handle and listener wiring.
pub mod core;

/// Directory of identified peers.
pub mod registry;

/// Request correlation and queue retries.
pub mod router;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{BrokerConfig, DEFAULT_PORT};
pub use core::{Broker, BrokerHandle, BrokerStats};
pub use registry::{ConnectionSnapshot, ConnectionStats, Registry, RegistryStats};
pub use router::{Router, RouterStats};
