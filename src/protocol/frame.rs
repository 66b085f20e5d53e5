//! Wire frames.
//!
//! Every message on the transport is one JSON text frame. Frames are not
//! tagged uniformly, so [`Frame`] classifies them by which fields are present:
//!
//! | Shape | Variant |
//! |-------|---------|
//! | `{clientType, ...}` | [`Frame::Hello`] |
//! | `{type, ...}` | [`Frame::Control`] |
//! | `{url, options, id}` | [`Frame::Fetch`] |
//! | `{id, response\|error}` | [`Frame::Outcome`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::fetch::{FetchOutcome, FetchRequest};

// ============================================================================
// Constants
// ============================================================================

/// Longest excerpt of an unparseable frame included in errors and logs.
const EXCERPT_LEN: usize = 120;

// ============================================================================
// ClientType
// ============================================================================

/// Role a peer declares in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Originates fetch requests.
    #[serde(alias = "backend")]
    Requester,
    /// Performs fetches inside a browser.
    #[serde(alias = "extension")]
    Executor,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requester => f.write_str("requester"),
            Self::Executor => f.write_str("executor"),
        }
    }
}

// ============================================================================
// Hello
// ============================================================================

/// Identity field a peer uses to be recognised across reconnects.
pub const INSTANCE_ID_FIELD: &str = "instanceId";

/// Handshake response: `{clientType, ...identity}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Declared role.
    #[serde(rename = "clientType")]
    pub client_type: ClientType,

    /// Any additional identity fields the peer chose to send.
    #[serde(flatten)]
    pub identity: Map<String, Value>,
}

impl Hello {
    /// Creates a handshake with no extra identity fields.
    #[inline]
    #[must_use]
    pub fn new(client_type: ClientType) -> Self {
        Self {
            client_type,
            identity: Map::new(),
        }
    }

    /// Adds the `instanceId` identity field.
    #[inline]
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.identity
            .insert(INSTANCE_ID_FIELD.to_string(), Value::String(instance_id.into()));
        self
    }
}

/// The `instanceId` field of a handshake identity, if it is a string.
#[must_use]
pub fn instance_id(identity: &Map<String, Value>) -> Option<&str> {
    identity.get(INSTANCE_ID_FIELD).and_then(Value::as_str)
}

// ============================================================================
// Control
// ============================================================================

/// Control messages discriminated by their `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Control {
    /// Broker asks a freshly connected peer to identify.
    Identify,
    /// Broker acknowledges the handshake.
    Identified,
    /// At least one executor is connected.
    ExtensionAvailable,
    /// The last executor went away.
    ExtensionUnavailable,
    /// Heartbeat ping.
    Ping {
        /// Sender's wall-clock time in milliseconds.
        #[serde(default)]
        timestamp: u64,
    },
    /// Heartbeat answer. Echoes the ping's timestamp.
    Pong {
        /// Timestamp copied from the ping.
        #[serde(default)]
        timestamp: u64,
    },
}

// ============================================================================
// Frame
// ============================================================================

/// Any message that can travel over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// Handshake response. Tried first so identity fields never shadow it.
    Hello(Hello),
    /// `type`-tagged control message.
    Control(Control),
    /// Fetch submission.
    Fetch(FetchRequest),
    /// Fetch result or failure.
    Outcome(FetchOutcome),
}

impl Frame {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the text is not JSON
    /// - [`Error::Protocol`] if it is JSON of no known shape
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(Error::protocol(format!(
                "frame is not an object: {}",
                excerpt(text)
            )));
        }

        // A frame carrying a result is an outcome even if it echoes `url`.
        let parsed = if is_outcome_shape(&value) {
            serde_json::from_value(value).map(Self::Outcome)
        } else {
            serde_json::from_value(value)
        };
        parsed.map_err(|_| Error::protocol(format!("unrecognised frame: {}", excerpt(text))))
    }

    /// Serializes the frame to a single-line JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if a payload value cannot be serialized.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `{type:"identify"}`.
    #[inline]
    #[must_use]
    pub fn identify() -> Self {
        Self::Control(Control::Identify)
    }

    /// `{type:"identified"}`.
    #[inline]
    #[must_use]
    pub fn identified() -> Self {
        Self::Control(Control::Identified)
    }

    /// Executor-pool availability notice.
    #[inline]
    #[must_use]
    pub fn availability(available: bool) -> Self {
        if available {
            Self::Control(Control::ExtensionAvailable)
        } else {
            Self::Control(Control::ExtensionUnavailable)
        }
    }

    /// Ping stamped with the current time.
    #[inline]
    #[must_use]
    pub fn ping() -> Self {
        Self::Control(Control::Ping {
            timestamp: now_millis(),
        })
    }

    /// Pong echoing `timestamp`.
    #[inline]
    #[must_use]
    pub fn pong(timestamp: u64) -> Self {
        Self::Control(Control::Pong { timestamp })
    }

    /// Handshake for the given role.
    #[inline]
    #[must_use]
    pub fn hello(client_type: ClientType) -> Self {
        Self::Hello(Hello::new(client_type))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Milliseconds since the Unix epoch. Zero if the clock is before 1970.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `id` plus `response` or `error`, and none of the handshake or control keys.
fn is_outcome_shape(value: &Value) -> bool {
    value.get("id").is_some()
        && (value.get("response").is_some() || value.get("error").is_some())
        && value.get("type").is_none()
        && value.get("clientType").is_none()
}

/// Truncates a frame for inclusion in an error message.
fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Tests
// ============================================================================
