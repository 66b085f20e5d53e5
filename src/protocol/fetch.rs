//! Fetch submission and outcome payloads.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// FetchRequest
// ============================================================================

/// `{url, options, id}`: a fetch submitted by a requester or routed to an
/// executor.
///
/// `options` is opaque to the broker and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Target URL.
    pub url: String,

    /// Fetch options (method, headers, body, `cookiejar`, `cookies`, ...).
    #[serde(default = "empty_options")]
    pub options: Value,

    /// Correlation id.
    pub id: RequestId,
}

impl FetchRequest {
    /// Creates a request.
    #[inline]
    #[must_use]
    pub fn new(id: RequestId, url: impl Into<String>, options: Value) -> Self {
        Self {
            url: url.into(),
            options,
            id,
        }
    }
}

/// Returns `true` if `options.cookiejar` is `true`.
#[inline]
#[must_use]
pub fn wants_cookiejar(options: &Value) -> bool {
    options
        .get("cookiejar")
        .and_then(Value::as_bool)
        .unwrap_or_default()
}

fn empty_options() -> Value {
    Value::Object(Map::new())
}

// ============================================================================
// FetchOutcome
// ============================================================================

/// `{id, response}` or `{id, error}`.
///
/// Both fields are kept as raw JSON so the broker can forward them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// Correlation id.
    pub id: RequestId,

    /// Response payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Error payload on failure. Usually a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl FetchOutcome {
    /// Creates a success outcome.
    #[inline]
    #[must_use]
    pub fn success(id: RequestId, response: Value) -> Self {
        Self {
            id,
            response: Some(response),
            error: None,
        }
    }

    /// Creates a failure outcome.
    #[inline]
    #[must_use]
    pub fn failure(id: RequestId, error: impl Into<String>) -> Self {
        Self {
            id,
            response: None,
            error: Some(Value::String(error.into())),
        }
    }

    /// Returns `true` if this outcome carries a usable response.
    ///
    /// A frame with both fields set counts as a failure.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.response.is_some()
    }

    /// Renders the error payload as text.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|error| match error {
            Value::String(message) => message.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        })
    }

    /// Converts the outcome into the caller-facing result.
    ///
    /// # Errors
    ///
    /// - [`Error::NoExecutorAvailable`], [`Error::DispatchFailed`] or
    ///   [`Error::ConnectionClosed`] if the broker failed the request
    /// - [`Error::Remote`] if the executor reported an error
    /// - [`Error::UnexpectedServerCondition`] if it carries neither field
    pub fn into_result(self) -> Result<FetchResponse> {
        if let Some(message) = self.error_message() {
            return Err(Error::from_wire(message));
        }

        match self.response {
            Some(body) => Ok(FetchResponse::new(body)),
            None => Err(Error::unexpected(format!(
                "outcome for {} has neither response nor error",
                self.id
            ))),
        }
    }
}

// ============================================================================
// Cookie
// ============================================================================

/// A cookie as exchanged with the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
}

impl Cookie {
    /// Creates a new cookie with name and value.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

// ============================================================================
// FetchResponse
// ============================================================================

/// Response payload handed back to the `fetch` caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    body: Value,
}

impl FetchResponse {
    /// Wraps a raw response payload.
    #[inline]
    #[must_use]
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    /// Returns the raw payload.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// HTTP status, if the executor reported one.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.body
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// Cookies the executor observed for the target domain.
    ///
    /// `None` if the payload has no `cookies` array. Malformed entries are
    /// skipped.
    #[must_use]
    pub fn cookies(&self) -> Option<Vec<Cookie>> {
        let array = self.body.get("cookies")?.as_array()?;
        Some(
            array
                .iter()
                .filter_map(|v| serde_json::from_value::<Cookie>(v.clone()).ok())
                .collect(),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
