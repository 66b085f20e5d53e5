//! Per-connection liveness tracking.
//!
//! The owner of a connection sends a ping every `interval` and arms a pong
//! timeout of `timeout`. Each timeout that fires before its pong arrives is a
//! miss:
//!
//! ```text
//!            miss (< max)          miss (>= max)
//! Healthy ───────────────► Degraded ──────────────► Critical ──► terminated
//!    ▲                        │
//!    └──────── pong ──────────┘
//! ```
//!
//! Nothing leaves `Critical`; the owner terminates the connection. Ping/pong
//! is symmetric, so the broker uses this for every peer and the requester
//! client uses it for its link to the broker.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timer::TimerHandle;

// ============================================================================
// Health
// ============================================================================

/// Heartbeat-derived health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// Answering pings.
    #[default]
    Healthy,
    /// Missed at least one pong, below the ceiling.
    Degraded,
    /// Missed `max_missed` pongs. Terminal.
    Critical,
}

impl Health {
    /// Ranking used for executor selection.
    #[inline]
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::Healthy => 2,
            Self::Degraded => 1,
            Self::Critical => 0,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

// ============================================================================
// HeartbeatConfig
// ============================================================================

/// Ping cadence and miss tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Time to wait for each pong.
    pub timeout: Duration,
    /// Consecutive misses that make a connection critical.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Checks that the values can drive the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a duration is zero, `max_missed` is
    /// zero, or the pong timeout is not shorter than the ping interval.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(Error::config("heartbeat interval and timeout must be non-zero"));
        }
        if self.timeout >= self.interval {
            return Err(Error::config(format!(
                "heartbeat timeout ({}ms) must be shorter than the interval ({}ms)",
                self.timeout.as_millis(),
                self.interval.as_millis()
            )));
        }
        if self.max_missed == 0 {
            return Err(Error::config("heartbeat max_missed must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// HeartbeatState
// ============================================================================

/// Heartbeat bookkeeping for one connection.
///
/// Every ping gets a sequence number. A pong-timeout event carries the
/// sequence it was armed for, and [`HeartbeatState::on_timeout`] ignores
/// events for superseded pings.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    last_ping_sent_at: Option<Instant>,
    awaiting_pong: bool,
    missed_count: u32,
    ping_seq: u64,
    pong_timeout: Option<TimerHandle>,
    health: Health,
    last_round_trip: Option<Duration>,
}

impl HeartbeatState {
    /// Creates a fresh, healthy state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a ping is about to be sent and returns its sequence.
    pub fn begin_ping(&mut self, now: Instant) -> u64 {
        self.ping_seq += 1;
        self.last_ping_sent_at = Some(now);
        self.awaiting_pong = true;
        self.ping_seq
    }

    /// Stores the timer for the current ping, cancelling any earlier one.
    pub fn arm_timeout(&mut self, handle: TimerHandle) {
        self.pong_timeout = Some(handle);
    }

    /// Handles a pong. Late pongs are accepted.
    ///
    /// Returns the health after the pong.
    pub fn on_pong(&mut self, now: Instant) -> Health {
        self.pong_timeout = None;
        if self.awaiting_pong {
            self.last_round_trip = self.last_ping_sent_at.map(|sent| now.duration_since(sent));
        }
        self.awaiting_pong = false;
        self.missed_count = 0;

        if self.health != Health::Critical {
            self.health = Health::Healthy;
        }
        self.health
    }

    /// Handles a fired pong timeout for ping `seq`.
    ///
    /// Returns `None` if the event is stale (a newer ping was sent, or the
    /// pong already arrived); otherwise the health after counting the miss.
    pub fn on_timeout(&mut self, seq: u64, max_missed: u32) -> Option<Health> {
        if seq != self.ping_seq || !self.awaiting_pong {
            return None;
        }

        self.pong_timeout = None;
        self.awaiting_pong = false;
        self.missed_count += 1;

        self.health = if self.health == Health::Critical || self.missed_count >= max_missed {
            Health::Critical
        } else {
            Health::Degraded
        };
        Some(self.health)
    }

    /// Current health.
    #[inline]
    #[must_use]
    pub fn health(&self) -> Health {
        self.health
    }

    /// Consecutive missed pongs.
    #[inline]
    #[must_use]
    pub fn missed_count(&self) -> u32 {
        self.missed_count
    }

    /// Whether a pong is outstanding.
    #[inline]
    #[must_use]
    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// When the last ping went out.
    #[inline]
    #[must_use]
    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// Round trip of the last answered ping.
    #[inline]
    #[must_use]
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_MISSED: u32 = 3;

    fn miss(state: &mut HeartbeatState) -> Option<Health> {
        let seq = state.begin_ping(Instant::now());
        state.on_timeout(seq, MAX_MISSED)
    }

    #[test]
    fn test_health_scores() {
        assert_eq!(Health::Healthy.score(), 2);
        assert_eq!(Health::Degraded.score(), 1);
        assert_eq!(Health::Critical.score(), 0);
    }

    #[test]
    fn test_misses_degrade_then_go_critical() {
        let mut state = HeartbeatState::new();

        assert_eq!(miss(&mut state), Some(Health::Degraded));
        assert_eq!(miss(&mut state), Some(Health::Degraded));
        assert_eq!(miss(&mut state), Some(Health::Critical));
        assert_eq!(state.missed_count(), 3);
    }

    #[test]
    fn test_pong_before_ceiling_resets_misses() {
        let mut state = HeartbeatState::new();
        miss(&mut state);
        miss(&mut state);

        state.begin_ping(Instant::now());
        assert_eq!(state.on_pong(Instant::now()), Health::Healthy);
        assert_eq!(state.missed_count(), 0);
        assert!(!state.awaiting_pong());

        // Counting starts over
        assert_eq!(miss(&mut state), Some(Health::Degraded));
    }

    #[test]
    fn test_late_pong_restores_without_double_counting() {
        let mut state = HeartbeatState::new();
        assert_eq!(miss(&mut state), Some(Health::Degraded));

        // Pong for the ping whose timeout already fired
        assert_eq!(state.on_pong(Instant::now()), Health::Healthy);
        assert_eq!(state.missed_count(), 0);
    }

    #[test]
    fn test_critical_is_sticky() {
        let mut state = HeartbeatState::new();
        for _ in 0..MAX_MISSED {
            miss(&mut state);
        }
        assert_eq!(state.health(), Health::Critical);

        assert_eq!(state.on_pong(Instant::now()), Health::Critical);
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let mut state = HeartbeatState::new();
        let first = state.begin_ping(Instant::now());
        let _second = state.begin_ping(Instant::now());

        assert_eq!(state.on_timeout(first, MAX_MISSED), None);
        assert_eq!(state.missed_count(), 0);
    }

    #[test]
    fn test_timeout_after_pong_is_ignored() {
        let mut state = HeartbeatState::new();
        let seq = state.begin_ping(Instant::now());
        state.on_pong(Instant::now());

        assert_eq!(state.on_timeout(seq, MAX_MISSED), None);
        assert_eq!(state.health(), Health::Healthy);
    }

    #[test]
    fn test_round_trip_recorded() {
        let mut state = HeartbeatState::new();
        let sent = Instant::now();
        state.begin_ping(sent);
        state.on_pong(sent + Duration::from_millis(40));
        assert_eq!(state.last_round_trip(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_config_validation() {
        assert!(HeartbeatConfig::default().validate().is_ok());

        let inverted = HeartbeatConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            max_missed: 3,
        };
        assert!(matches!(inverted.validate(), Err(Error::Config { .. })));

        let zero_missed = HeartbeatConfig {
            max_missed: 0,
            ..HeartbeatConfig::default()
        };
        assert!(zero_missed.validate().is_err());
    }
}
