//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing broker-assigned connection ids with
//! caller-generated request ids.
//!
//! | Type | Origin | Format |
//! |------|--------|--------|
//! | [`ConnectionId`] | Broker, one per accepted socket | Monotonic `u64` |
//! | [`RequestId`] | Requester, one per send attempt | Opaque string (UUID v4 by default) |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionId
// ============================================================================

/// Process-wide counter for connection ids. Starts at 1.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Broker-assigned identifier for one accepted transport.
///
/// Ids are strictly increasing, so ordering by id is ordering by accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next connection id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value.
    #[inline]
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Correlation id carried in `{url, options, id}` and `{id, response|error}`.
///
/// Generated by the requester. Uniqueness for the lifetime of the broker is a
/// caller contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_increase() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::from_u64(7).to_string(), "conn-7");
    }

    #[test]
    fn test_generated_request_ids_differ() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_request_id_is_transparent_on_the_wire() {
        let id = RequestId::from("r1");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"r1\"");

        let parsed: RequestId = serde_json::from_str("\"r2\"").expect("parse");
        assert_eq!(parsed.as_str(), "r2");
    }
}
