//! Request router.
//!
//! Moves fetch submissions from requesters to executors and outcomes back.
//! Every request id lives in exactly one of two tables:
//!
//! | Table | Meaning | Leaves by |
//! |-------|---------|-----------|
//! | in-flight | sent to an executor, awaiting its outcome | outcome, executor disconnect, origin disconnect |
//! | queued | no executor was available | promotion, retry exhaustion, origin disconnect |
//!
//! Every exit from either table is terminal for that id, and at most one
//! outcome frame is sent to the origin per id.
//!
//! The router does not own connections. Each operation borrows the
//! [`Registry`] for executor selection and for writing to peers.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{FetchOutcome, FetchRequest, Frame};
use crate::timer::TimerHandle;

use super::registry::Registry;

// ============================================================================
// RetryScheduler
// ============================================================================

/// Arms the timer that re-attempts executor selection for a queued request.
pub trait RetryScheduler {
    /// Schedules a retry of `request_id` after `delay`.
    fn schedule_retry(&self, request_id: RequestId, delay: Duration) -> TimerHandle;
}

// ============================================================================
// Table Entries
// ============================================================================

/// A request sent to an executor.
#[derive(Debug)]
struct InFlightRequest {
    origin: ConnectionId,
    target: ConnectionId,
    request: FetchRequest,
    submitted_at: Instant,
}

/// A request waiting for an executor.
#[derive(Debug)]
struct QueuedRequest {
    origin: ConnectionId,
    request: FetchRequest,
    submitted_at: Instant,
    retries: u32,
    /// Dropping this cancels the pending retry.
    retry_timer: TimerHandle,
}

// ============================================================================
// RouterStats
// ============================================================================

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Submissions accepted (duplicates excluded).
    pub total_requests: u64,
    /// Outcomes forwarded that carried a response.
    pub succeeded: u64,
    /// Requests that ended in an error, from any source.
    pub failed: u64,
    /// Requests failed because no executor arrived in time.
    pub no_executor_failures: u64,
    /// Requests failed because the selected executor could not be written.
    pub dispatch_failures: u64,
    /// Requests currently awaiting an executor outcome.
    pub in_flight: usize,
    /// Requests currently awaiting an executor.
    pub queued: usize,
}

// ============================================================================
// Router
// ============================================================================

/// Correlation tables plus the queue retry policy.
pub struct Router {
    in_flight: FxHashMap<RequestId, InFlightRequest>,
    queued: FxHashMap<RequestId, QueuedRequest>,
    retry_delay: Duration,
    max_retries: u32,
    stats: RouterStats,
}

impl Router {
    /// Creates a router that retries queued requests every `retry_delay`,
    /// giving up after `max_retries` retries.
    #[must_use]
    pub fn new(retry_delay: Duration, max_retries: u32) -> Self {
        Self {
            in_flight: FxHashMap::default(),
            queued: FxHashMap::default(),
            retry_delay,
            max_retries,
            stats: RouterStats::default(),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Accepts a fetch submission from `origin`.
    ///
    /// Dispatches to the best executor if there is one, otherwise queues the
    /// request and schedules the first selection retry.
    pub fn submit(
        &mut self,
        registry: &mut Registry,
        scheduler: &impl RetryScheduler,
        origin: ConnectionId,
        request: FetchRequest,
        now: Instant,
    ) {
        if self.contains(&request.id) {
            warn!(
                connection_id = %origin,
                request_id = %request.id,
                "Rejecting duplicate request id"
            );
            let message = format!("Duplicate request id: {}", request.id);
            respond(registry, origin, FetchOutcome::failure(request.id, message));
            return;
        }

        self.stats.total_requests += 1;
        debug!(connection_id = %origin, request_id = %request.id, url = %request.url, "Request submitted");

        match registry.best_executor() {
            Some(target) => self.dispatch(registry, origin, target, request, now),
            None => {
                info!(request_id = %request.id, "No executor available, queueing request");
                let retry_timer = scheduler.schedule_retry(request.id.clone(), self.retry_delay);
                self.queued.insert(
                    request.id.clone(),
                    QueuedRequest {
                        origin,
                        request,
                        submitted_at: now,
                        retries: 0,
                        retry_timer,
                    },
                );
            }
        }
    }

    /// Handles a fired retry timer for a queued request.
    ///
    /// Stale timers (the request was promoted or purged) are ignored.
    pub fn on_retry(
        &mut self,
        registry: &mut Registry,
        scheduler: &impl RetryScheduler,
        request_id: &RequestId,
    ) {
        let Some(mut queued) = self.queued.remove(request_id) else {
            return;
        };
        queued.retries += 1;

        if let Some(target) = registry.best_executor() {
            debug!(request_id = %request_id, retries = queued.retries, "Executor found on retry");
            self.dispatch(registry, queued.origin, target, queued.request, queued.submitted_at);
            return;
        }

        if queued.retries >= self.max_retries {
            warn!(
                request_id = %request_id,
                retries = queued.retries,
                "Giving up on queued request"
            );
            self.stats.no_executor_failures += 1;
            self.fail(registry, queued.origin, queued.request.id, &Error::NoExecutorAvailable);
            return;
        }

        debug!(request_id = %request_id, retries = queued.retries, "Still no executor, retrying later");
        queued.retry_timer = scheduler.schedule_retry(request_id.clone(), self.retry_delay);
        self.queued.insert(request_id.clone(), queued);
    }

    /// Dispatches queued requests now that an executor is available.
    ///
    /// Oldest first. Returns how many were dispatched.
    pub fn promote_queued(&mut self, registry: &mut Registry) -> usize {
        if self.queued.is_empty() {
            return 0;
        }

        let mut waiting: Vec<QueuedRequest> = self.queued.drain().map(|(_, q)| q).collect();
        waiting.sort_by_key(|q| q.submitted_at);

        let mut promoted = 0;
        let mut waiting = waiting.into_iter();
        while let Some(queued) = waiting.next() {
            let Some(target) = registry.best_executor() else {
                // Executor vanished mid-promotion; keep the rest queued
                self.queued.insert(queued.request.id.clone(), queued);
                for rest in waiting.by_ref() {
                    self.queued.insert(rest.request.id.clone(), rest);
                }
                break;
            };
            self.dispatch(registry, queued.origin, target, queued.request, queued.submitted_at);
            promoted += 1;
        }

        if promoted > 0 {
            info!(promoted, "Promoted queued requests");
        }
        promoted
    }

    fn dispatch(
        &mut self,
        registry: &mut Registry,
        origin: ConnectionId,
        target: ConnectionId,
        request: FetchRequest,
        submitted_at: Instant,
    ) {
        let sent = match registry.get(target) {
            Some(executor) => executor.send(&Frame::Fetch(request.clone())),
            None => Err(Error::ConnectionClosed),
        };

        match sent {
            Ok(()) => {
                debug!(request_id = %request.id, executor = %target, "Request dispatched");
                self.in_flight.insert(
                    request.id.clone(),
                    InFlightRequest {
                        origin,
                        target,
                        request,
                        submitted_at,
                    },
                );
            }
            Err(e) => {
                warn!(request_id = %request.id, executor = %target, error = %e, "Dispatch failed");
                self.stats.dispatch_failures += 1;
                self.fail(registry, origin, request.id, &Error::dispatch_failed(e.to_string()));
            }
        }
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    /// Correlates an executor outcome and forwards it to the origin.
    ///
    /// Outcomes for unknown ids (late, duplicate, or purged) are dropped.
    pub fn on_executor_response(
        &mut self,
        registry: &mut Registry,
        executor: ConnectionId,
        outcome: FetchOutcome,
        now: Instant,
    ) {
        let Some(entry) = self.in_flight.remove(&outcome.id) else {
            debug!(request_id = %outcome.id, executor = %executor, "Dropping outcome for unknown request");
            return;
        };

        if entry.target != executor {
            debug!(
                request_id = %outcome.id,
                expected = %entry.target,
                actual = %executor,
                "Outcome arrived from a different executor"
            );
        }

        let success = outcome.is_success();
        if success {
            self.stats.succeeded += 1;
        } else {
            self.stats.failed += 1;
        }

        if let Some(target) = registry.get_mut(entry.target) {
            target.stats.record_outcome(success);
        }

        if let Some(origin) = registry.get_mut(entry.origin) {
            origin.stats.record_outcome(success);
            origin
                .stats
                .record_response_time(now.saturating_duration_since(entry.submitted_at));
        }

        debug!(request_id = %outcome.id, success, url = %entry.request.url, "Forwarding outcome");
        respond(registry, entry.origin, outcome);
    }

    // ========================================================================
    // Purge
    // ========================================================================

    /// Removes every request touching a departed connection.
    ///
    /// Requests the connection originated are dropped (nobody is left to
    /// answer). Requests in flight on it as executor are failed to their
    /// origin. Returns the number of entries removed.
    pub fn purge_connection(&mut self, registry: &mut Registry, id: ConnectionId) -> usize {
        let orphaned: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, r)| r.origin == id || r.target == id)
            .map(|(request_id, _)| request_id.clone())
            .collect();

        let mut purged = 0;
        for request_id in orphaned {
            let Some(entry) = self.in_flight.remove(&request_id) else {
                continue;
            };
            purged += 1;
            if entry.origin != id {
                self.fail(registry, entry.origin, request_id, &Error::ConnectionClosed);
            }
        }

        let before = self.queued.len();
        self.queued.retain(|_, q| q.origin != id);
        purged += before - self.queued.len();

        if purged > 0 {
            debug!(connection_id = %id, purged, "Purged requests for departed connection");
        }
        purged
    }

    fn fail(&mut self, registry: &mut Registry, origin: ConnectionId, id: RequestId, error: &Error) {
        self.stats.failed += 1;
        if let Some(entry) = registry.get_mut(origin) {
            entry.stats.record_outcome(false);
        }
        respond(registry, origin, FetchOutcome::failure(id, error.to_string()));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns `true` if the id is in flight or queued.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.in_flight.contains_key(id) || self.queued.contains_key(id)
    }

    /// Requests awaiting an executor outcome.
    #[inline]
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests awaiting an executor.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Counters plus current table sizes.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            in_flight: self.in_flight.len(),
            queued: self.queued.len(),
            ..self.stats
        }
    }
}

/// Writes an outcome to `origin` if it is still there.
fn respond(registry: &Registry, origin: ConnectionId, outcome: FetchOutcome) {
    match registry.get(origin) {
        Some(entry) if entry.is_open() => {
            if let Err(e) = entry.send(&Frame::Outcome(outcome)) {
                warn!(connection_id = %origin, error = %e, "Failed to deliver outcome");
            }
        }
        _ => {
            debug!(connection_id = %origin, request_id = %outcome.id, "Origin gone, outcome discarded");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
