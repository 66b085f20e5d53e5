//! Connection registry.
//!
//! Directory of identified peers, partitioned by role. A connection appears
//! here only after its handshake; before that the broker holds it as
//! unidentified. Each entry owns its heartbeat state, including the pending
//! pong timer, so removing an entry cancels its timers.
//!
//! Partitions are ordered by [`ConnectionId`], which makes "first
//! encountered" in [`Registry::best_executor`] mean "connected earliest".

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::heartbeat::{Health, HeartbeatState};
use crate::identifiers::ConnectionId;
use crate::protocol::{ClientType, Frame, instance_id};
use crate::transport::FrameSink;

// ============================================================================
// Constants
// ============================================================================

/// Weight of the newest sample in the response-time moving average.
const RESPONSE_TIME_WEIGHT: f64 = 0.3;

// ============================================================================
// ConnectionStats
// ============================================================================

/// Usage counters for one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Requests this connection originated or executed that reached a
    /// terminal outcome.
    pub requests_processed: u64,
    /// Of those, how many succeeded.
    pub requests_succeeded: u64,
    /// Of those, how many failed.
    pub requests_failed: u64,
    /// Exponential moving average of response time, in milliseconds.
    pub avg_response_time_ms: Option<f64>,
}

impl ConnectionStats {
    /// Counts one terminal outcome.
    pub fn record_outcome(&mut self, success: bool) {
        self.requests_processed += 1;
        if success {
            self.requests_succeeded += 1;
        } else {
            self.requests_failed += 1;
        }
    }

    /// Folds a response time into the moving average.
    pub fn record_response_time(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_time_ms = Some(match self.avg_response_time_ms {
            Some(avg) => RESPONSE_TIME_WEIGHT * sample + (1.0 - RESPONSE_TIME_WEIGHT) * avg,
            None => sample,
        });
    }
}

// ============================================================================
// ConnectionEntry
// ============================================================================

/// One identified peer.
pub struct ConnectionEntry {
    /// Broker-assigned id.
    pub id: ConnectionId,
    /// Declared role. Never changes for the life of the entry.
    pub role: ClientType,
    /// Extra fields from the handshake.
    pub identity: Map<String, Value>,
    /// When the underlying socket was accepted.
    pub connected_at: Instant,
    /// Last time any frame arrived.
    pub last_activity: Instant,
    /// Ping/pong bookkeeping.
    pub heartbeat: HeartbeatState,
    /// Usage counters.
    pub stats: ConnectionStats,
    /// Outbound channel.
    sink: Arc<dyn FrameSink>,
}

impl ConnectionEntry {
    /// Heartbeat-derived health.
    #[inline]
    #[must_use]
    pub fn health(&self) -> Health {
        self.heartbeat.health()
    }

    /// Whether the channel still accepts frames.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Sends a frame to this peer.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the channel is closed.
    #[inline]
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.sink.send_frame(frame)
    }

    /// Closes the channel.
    #[inline]
    pub fn close(&self) {
        self.sink.close();
    }

    /// Returns a copy of the channel handle.
    #[inline]
    #[must_use]
    pub fn sink(&self) -> Arc<dyn FrameSink> {
        Arc::clone(&self.sink)
    }

    /// Point-in-time summary for reporting.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            role: self.role,
            health: self.health(),
            missed_pongs: self.heartbeat.missed_count(),
            stats: self.stats.clone(),
            connected_for: now.saturating_duration_since(self.connected_at),
            idle_for: now.saturating_duration_since(self.last_activity),
        }
    }
}

// ============================================================================
// ConnectionSnapshot
// ============================================================================

/// Copy of one entry's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub id: ConnectionId,
    /// Role.
    pub role: ClientType,
    /// Health.
    pub health: Health,
    /// Consecutive missed pongs.
    pub missed_pongs: u32,
    /// Usage counters.
    pub stats: ConnectionStats,
    /// Time since the socket was accepted.
    pub connected_for: Duration,
    /// Time since the last inbound frame.
    pub idle_for: Duration,
}

// ============================================================================
// Registration
// ============================================================================

/// Result of [`Registry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First registration for this peer.
    New,
    /// The connection was already registered with the same role. Only its
    /// identity fields were updated.
    Refreshed,
    /// The peer reconnected on a new socket while its old entry was still
    /// registered. The old entry was removed and its channel closed.
    Reconnected {
        /// Id of the replaced entry.
        replaced: ConnectionId,
        /// Role of the replaced entry.
        previous_role: ClientType,
    },
}

/// Lifetime counters for the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// First-time registrations.
    pub total_connections: u64,
    /// Registrations that replaced a stale entry of the same instance.
    pub reconnections: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Identified peers, partitioned by role.
#[derive(Default)]
pub struct Registry {
    requesters: BTreeMap<ConnectionId, ConnectionEntry>,
    executors: BTreeMap<ConnectionId, ConnectionEntry>,
    stats: RegistryStats,
}

impl Registry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the entry for `id`, or replaces a stale one.
    ///
    /// A peer that sends an `instanceId` identity field is recognised when it
    /// comes back on a new socket: if an entry with the same instance id is
    /// still registered, it is replaced. The replacement keeps the usage
    /// counters, starts a fresh heartbeat, and may carry a different role.
    /// The caller must purge requests routed through the replaced id.
    ///
    /// Registering an id that is already present only refreshes its identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `id` is already registered with another
    /// role. A connection's role never changes.
    pub fn register(
        &mut self,
        id: ConnectionId,
        role: ClientType,
        sink: Arc<dyn FrameSink>,
        identity: Map<String, Value>,
        now: Instant,
    ) -> Result<Registration> {
        if let Some(entry) = self.get_mut(id) {
            if entry.role != role {
                return Err(Error::protocol(format!(
                    "connection {id} is registered as {}, refusing {role}",
                    entry.role
                )));
            }
            entry.identity = identity;
            return Ok(Registration::Refreshed);
        }

        let stale = instance_id(&identity)
            .and_then(|instance| self.find_instance(instance))
            .and_then(|old| self.unregister(old));

        let (registration, stats) = match stale {
            Some(old) => {
                old.close();
                self.stats.reconnections += 1;
                let registration = Registration::Reconnected {
                    replaced: old.id,
                    previous_role: old.role,
                };
                (registration, old.stats)
            }
            None => {
                self.stats.total_connections += 1;
                (Registration::New, ConnectionStats::default())
            }
        };

        let entry = ConnectionEntry {
            id,
            role,
            identity,
            connected_at: now,
            last_activity: now,
            heartbeat: HeartbeatState::new(),
            stats,
            sink,
        };
        self.partition_mut(role).insert(id, entry);

        Ok(registration)
    }

    /// Removes the entry for `id`, dropping its timers.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.requesters
            .remove(&id)
            .or_else(|| self.executors.remove(&id))
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.requesters.get(&id).or_else(|| self.executors.get(&id))
    }

    /// Looks up an entry mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionEntry> {
        match self.requesters.get_mut(&id) {
            Some(entry) => Some(entry),
            None => self.executors.get_mut(&id),
        }
    }

    /// Entries with the given role, oldest first.
    pub fn list_by_role(&self, role: ClientType) -> impl Iterator<Item = &ConnectionEntry> {
        self.partition(role).values()
    }

    /// Every registered id.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.requesters
            .keys()
            .chain(self.executors.keys())
            .copied()
            .collect()
    }

    /// Picks the executor to route to.
    ///
    /// Open executors only; prefers higher health score, stops at the first
    /// healthy one, and breaks ties by connection age.
    #[must_use]
    pub fn best_executor(&self) -> Option<ConnectionId> {
        let mut best: Option<(ConnectionId, u8)> = None;

        for entry in self.executors.values() {
            if !entry.is_open() {
                continue;
            }

            let health = entry.health();
            if health == Health::Critical {
                continue;
            }
            if health == Health::Healthy {
                return Some(entry.id);
            }

            let score = health.score();
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((entry.id, score));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Number of executors with an open channel.
    #[must_use]
    pub fn open_executor_count(&self) -> usize {
        self.executors.values().filter(|e| e.is_open()).count()
    }

    /// Number of registered entries with the given role.
    #[inline]
    #[must_use]
    pub fn count(&self, role: ClientType) -> usize {
        self.partition(role).len()
    }

    /// Total registered entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.requesters.len() + self.executors.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Snapshots of every entry, requesters first.
    #[must_use]
    pub fn snapshots(&self, now: Instant) -> Vec<ConnectionSnapshot> {
        self.requesters
            .values()
            .chain(self.executors.values())
            .map(|entry| entry.snapshot(now))
            .collect()
    }

    fn find_instance(&self, instance: &str) -> Option<ConnectionId> {
        self.requesters
            .values()
            .chain(self.executors.values())
            .find(|entry| instance_id(&entry.identity) == Some(instance))
            .map(|entry| entry.id)
    }

    fn partition(&self, role: ClientType) -> &BTreeMap<ConnectionId, ConnectionEntry> {
        match role {
            ClientType::Requester => &self.requesters,
            ClientType::Executor => &self.executors,
        }
    }

    fn partition_mut(&mut self, role: ClientType) -> &mut BTreeMap<ConnectionId, ConnectionEntry> {
        match role {
            ClientType::Requester => &mut self.requesters,
            ClientType::Executor => &mut self.executors,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
