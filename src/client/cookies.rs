//! Per-hostname cookie cache.
//!
//! Each [`RelayClient`](super::RelayClient) owns one store. Calls made with
//! `options.cookiejar == true` carry the stored cookies for the target host,
//! and every response that reports cookies replaces the stored set for that
//! host. Writes replace; they never merge.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tracing::trace;
use url::Url;

use crate::protocol::Cookie;

// ============================================================================
// CookieStore
// ============================================================================

/// Hostname to ordered cookie list.
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    hosts: FxHashMap<String, Vec<Cookie>>,
}

impl CookieStore {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cookies recorded for the URL's hostname, in write order.
    ///
    /// Empty if none are recorded or the URL has no host.
    #[must_use]
    pub fn get(&self, url: &str) -> Vec<Cookie> {
        hostname(url)
            .and_then(|host| self.hosts.get(&host).cloned())
            .unwrap_or_default()
    }

    /// Replaces the cookies for the URL's hostname.
    ///
    /// Returns `false` and stores nothing if the URL has no host.
    pub fn set(&mut self, url: &str, cookies: Vec<Cookie>) -> bool {
        let Some(host) = hostname(url) else {
            trace!(url, "Ignoring cookies for URL without host");
            return false;
        };
        trace!(host = %host, count = cookies.len(), "Storing cookies");
        self.hosts.insert(host, cookies);
        true
    }

    /// Forgets every host.
    #[inline]
    pub fn clear(&mut self) {
        self.hosts.clear();
    }

    /// Number of hosts with recorded cookies.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Returns `true` if nothing is recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn hostname(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
}

// ============================================================================
// Tests
// ============================================================================
