//! Broker event loop.
//!
//! One task owns the [`Registry`] and [`Router`] and processes a single
//! queue of [`BrokerEvent`]s. Transports, timers and the public handle only
//! ever post events, so every state change happens on that one task.
//!
//! ```text
//! RelayServer ──accept──► forwarder ──Frame/Closed──┐
//! retry / pong timers ──RetryQueued/PongTimeout─────┼──► BrokerCore ──► Registry
//! BrokerHandle ──Stats/Shutdown─────────────────────┘         │
//!                                                             └──────► Router
//! ```
//!
//! # Handshake
//!
//! | Step | Broker does |
//! |------|-------------|
//! | socket accepted | sends `{type:"identify"}`, holds the peer as unidentified |
//! | no handshake within `handshake_timeout` | closes the socket |
//! | `{clientType}` received | registers the peer, sends `{type:"identified"}` |
//! | same `instanceId` as a live entry | replaces that entry, failing what was routed through it |
//! | repeated `{clientType}`, same role | re-sends `{type:"identified"}` |
//! | repeated `{clientType}`, other role | closes the socket |
//! | executor registered | announces availability if it is the first, promotes queued requests |
//! | requester registered | tells it whether an executor is available |

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::heartbeat::Health;
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{ClientType, Control, FetchOutcome, FetchRequest, Frame, Hello};
use crate::timer::{self, TimerHandle};
use crate::transport::server::ConnectionCallback;
use crate::transport::{FrameSink, RelayServer, TransportEvent};

use super::config::BrokerConfig;
use super::registry::{ConnectionSnapshot, Registration, Registry, RegistryStats};
use super::router::{RetryScheduler, Router, RouterStats};

// ============================================================================
// Events
// ============================================================================

/// Everything the broker loop reacts to.
pub(crate) enum BrokerEvent {
    /// A transport was accepted.
    Connected {
        id: ConnectionId,
        sink: Arc<dyn FrameSink>,
    },
    /// A text frame arrived.
    Frame { id: ConnectionId, text: String },
    /// A transport closed.
    Closed { id: ConnectionId },
    /// A pong deadline passed.
    PongTimeout { id: ConnectionId, seq: u64 },
    /// An accepted socket did not identify in time.
    HandshakeTimeout { id: ConnectionId },
    /// A queued request's selection retry is due.
    RetryQueued { request_id: RequestId },
    /// Stats query from a handle.
    Stats { reply: oneshot::Sender<BrokerStats> },
    /// Stop the loop.
    Shutdown,
}

// ============================================================================
// BrokerStats
// ============================================================================

/// Point-in-time view of the broker.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Time since the loop started.
    pub uptime: Duration,
    /// Lifetime registration counters.
    pub connections: RegistryStats,
    /// Identified requesters.
    pub requesters: usize,
    /// Identified executors.
    pub executors: usize,
    /// Connections that have not completed the handshake.
    pub unidentified: usize,
    /// Routing counters.
    pub router: RouterStats,
    /// Per-connection detail.
    pub snapshots: Vec<ConnectionSnapshot>,
}

// ============================================================================
// Broker
// ============================================================================

/// Entry point for running a broker.
///
/// # Example
///
/// ```no_run
/// use fetch_relay::{Broker, BrokerConfig};
///
/// # async fn example() -> fetch_relay::Result<()> {
/// let broker = Broker::start(BrokerConfig::new().with_port(0)).await?;
/// println!("broker listening on {}", broker.ws_url().unwrap_or_default());
///
/// tokio::signal::ctrl_c().await?;
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Broker;

impl Broker {
    /// Validates `config`, binds the listener and starts the broker.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::Io`] if the address cannot be bound
    pub async fn start(config: BrokerConfig) -> Result<BrokerHandle> {
        config.validate()?;

        let server = RelayServer::bind(config.socket_addr()).await?;
        let local_addr = server.local_addr();

        let mut handle = Self::spawn_core(config);
        handle.local_addr = Some(local_addr);

        let events_tx = handle.events_tx.clone();
        let on_connection: ConnectionCallback = Arc::new(move |connection, events, addr| {
            let id = attach(&events_tx, Arc::new(connection), events);
            info!(connection_id = %id, %addr, "Peer connected");
        });

        handle.server_task = Some(tokio::spawn(
            server.serve(on_connection, handle.shutdown_rx.clone()),
        ));

        info!(%local_addr, "Broker started");
        Ok(handle)
    }

    /// Starts the broker loop without a listener.
    ///
    /// Transports are supplied through [`BrokerHandle::attach`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn start_detached(config: BrokerConfig) -> Result<BrokerHandle> {
        config.validate()?;
        Ok(Self::spawn_core(config))
    }

    fn spawn_core(config: BrokerConfig) -> BrokerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = BrokerCore::new(config, events_tx.clone());
        let core_task = tokio::spawn(core.run(events_rx));

        BrokerHandle {
            events_tx,
            shutdown_tx,
            shutdown_rx,
            local_addr: None,
            core_task: Some(core_task),
            server_task: None,
        }
    }
}

// ============================================================================
// BrokerHandle
// ============================================================================

/// Control handle for a running broker.
///
/// Dropping the handle stops the broker.
pub struct BrokerHandle {
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    local_addr: Option<SocketAddr>,
    core_task: Option<JoinHandle<()>>,
    server_task: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    /// Address of the listener, if there is one.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `ws://` URL of the listener, if there is one.
    #[must_use]
    pub fn ws_url(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("ws://{addr}"))
    }

    /// Hands a transport to the broker and returns its connection id.
    pub fn attach(
        &self,
        sink: Arc<dyn FrameSink>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> ConnectionId {
        attach(&self.events_tx, sink, events)
    }

    /// Queries the broker's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker has stopped.
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (reply, rx) = oneshot::channel();
        self.events_tx
            .send(BrokerEvent::Stats { reply })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(rx.await?)
    }

    /// Stops accepting, closes every connection and waits for the loop to
    /// finish.
    pub async fn shutdown(mut self) {
        self.signal_shutdown();

        if let Some(task) = self.server_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.core_task.take() {
            let _ = task.await;
        }
        info!("Broker stopped");
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.events_tx.send(BrokerEvent::Shutdown);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// Assigns an id and spawns the task that forwards transport events.
fn attach(
    events_tx: &mpsc::UnboundedSender<BrokerEvent>,
    sink: Arc<dyn FrameSink>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> ConnectionId {
    let id = ConnectionId::next();
    let _ = events_tx.send(BrokerEvent::Connected { id, sink });

    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let forwarded = match event {
                TransportEvent::Frame(text) => events_tx.send(BrokerEvent::Frame { id, text }),
                TransportEvent::Closed => break,
            };
            if forwarded.is_err() {
                return;
            }
        }
        let _ = events_tx.send(BrokerEvent::Closed { id });
    });

    id
}

// ============================================================================
// BrokerCore
// ============================================================================

/// Connection that has not sent its handshake yet.
struct Unidentified {
    sink: Arc<dyn FrameSink>,
    connected_at: Instant,
    _deadline: TimerHandle,
}

/// Posts retry events back into the broker loop.
struct EventScheduler(mpsc::UnboundedSender<BrokerEvent>);

impl RetryScheduler for EventScheduler {
    fn schedule_retry(&self, request_id: RequestId, delay: Duration) -> TimerHandle {
        timer::schedule(&self.0, delay, BrokerEvent::RetryQueued { request_id })
    }
}

/// State owned by the broker task.
struct BrokerCore {
    config: BrokerConfig,
    registry: Registry,
    router: Router,
    unidentified: FxHashMap<ConnectionId, Unidentified>,
    scheduler: EventScheduler,
    started_at: Instant,
}

impl BrokerCore {
    fn new(config: BrokerConfig, events_tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        let router = Router::new(config.queue_retry_delay, config.queue_max_retries);
        Self {
            config,
            registry: Registry::new(),
            router,
            unidentified: FxHashMap::default(),
            scheduler: EventScheduler(events_tx),
            started_at: now(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        let mut heartbeat = ticker(self.config.heartbeat.interval);
        let mut stats_report = self.config.stats_interval.map(ticker);

        debug!("Broker loop started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(BrokerEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event),
                    }
                }

                _ = heartbeat.tick() => self.send_pings(),

                _ = tick_optional(&mut stats_report) => self.log_stats(),
            }
        }

        self.close_all();
        debug!("Broker loop terminated");
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected { id, sink } => self.on_connected(id, sink),
            BrokerEvent::Frame { id, text } => self.on_frame(id, &text),
            BrokerEvent::Closed { id } => self.disconnect(id, "transport closed"),
            BrokerEvent::PongTimeout { id, seq } => self.on_pong_timeout(id, seq),
            BrokerEvent::HandshakeTimeout { id } => {
                if self.unidentified.contains_key(&id) {
                    warn!(connection_id = %id, "No handshake received, closing");
                    self.disconnect(id, "handshake timeout");
                }
            }
            BrokerEvent::RetryQueued { request_id } => {
                self.router
                    .on_retry(&mut self.registry, &self.scheduler, &request_id);
            }
            BrokerEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            BrokerEvent::Shutdown => {}
        }
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    fn on_connected(&mut self, id: ConnectionId, sink: Arc<dyn FrameSink>) {
        if let Err(e) = sink.send_frame(&Frame::identify()) {
            warn!(connection_id = %id, error = %e, "Failed to send identify prompt");
        }
        let deadline = timer::schedule(
            &self.scheduler.0,
            self.config.handshake_timeout,
            BrokerEvent::HandshakeTimeout { id },
        );
        self.unidentified.insert(
            id,
            Unidentified {
                sink,
                connected_at: now(),
                _deadline: deadline,
            },
        );
        debug!(connection_id = %id, "Awaiting handshake");
    }

    fn on_hello(&mut self, id: ConnectionId, hello: Hello) {
        let sink = match self.unidentified.get(&id) {
            Some(pending) => Arc::clone(&pending.sink),
            None => match self.registry.get(id) {
                Some(entry) => entry.sink(),
                None => {
                    warn!(connection_id = %id, "Handshake from unknown connection");
                    return;
                }
            },
        };

        let executors_before = self.registry.count(ClientType::Executor);
        let role = hello.client_type;
        let registration =
            match self
                .registry
                .register(id, role, Arc::clone(&sink), hello.identity, now())
            {
                Ok(registration) => registration,
                Err(e) => {
                    warn!(connection_id = %id, %role, error = %e, "Refusing handshake");
                    self.disconnect(id, "role change refused");
                    return;
                }
            };

        if let Some(pending) = self.unidentified.remove(&id) {
            debug!(
                connection_id = %id,
                waited_ms = now().saturating_duration_since(pending.connected_at).as_millis() as u64,
                "Handshake received"
            );
        }

        match registration {
            Registration::New => info!(connection_id = %id, %role, "Peer identified"),
            Registration::Refreshed => {
                debug!(connection_id = %id, %role, "Repeated handshake acknowledged");
                if let Err(e) = sink.send_frame(&Frame::identified()) {
                    warn!(connection_id = %id, error = %e, "Failed to acknowledge handshake");
                }
                return;
            }
            Registration::Reconnected {
                replaced,
                previous_role,
            } => {
                let purged = self.router.purge_connection(&mut self.registry, replaced);
                info!(
                    connection_id = %id,
                    %role,
                    replaced = %replaced,
                    %previous_role,
                    purged,
                    "Peer reconnected"
                );
            }
        }

        if let Err(e) = sink.send_frame(&Frame::identified()) {
            warn!(connection_id = %id, error = %e, "Failed to acknowledge handshake");
        }

        match role {
            ClientType::Executor => {
                self.router.promote_queued(&mut self.registry);
            }
            ClientType::Requester => {
                let available = self.registry.open_executor_count() > 0;
                if let Err(e) = sink.send_frame(&Frame::availability(available)) {
                    debug!(connection_id = %id, error = %e, "Failed to send availability");
                }
            }
        }

        self.announce_availability_change(executors_before);
    }

    /// Removes a connection and everything routed through it.
    fn disconnect(&mut self, id: ConnectionId, reason: &str) {
        if let Some(pending) = self.unidentified.remove(&id) {
            pending.sink.close();
            debug!(connection_id = %id, reason, "Unidentified connection removed");
            return;
        }

        let executors_before = self.registry.count(ClientType::Executor);
        let Some(entry) = self.registry.unregister(id) else {
            return;
        };
        entry.close();

        let purged = self.router.purge_connection(&mut self.registry, id);
        info!(
            connection_id = %id,
            role = %entry.role,
            reason,
            purged,
            "Peer disconnected"
        );

        self.announce_availability_change(executors_before);
    }

    /// Broadcasts to requesters when the executor pool becomes empty or
    /// non-empty.
    fn announce_availability_change(&self, executors_before: usize) {
        let executors_after = self.registry.count(ClientType::Executor);
        let available = match (executors_before, executors_after) {
            (0, n) if n > 0 => true,
            (n, 0) if n > 0 => false,
            _ => return,
        };

        info!(available, executors = executors_after, "Executor availability changed");
        let frame = Frame::availability(available);
        for requester in self.registry.list_by_role(ClientType::Requester) {
            if requester.is_open()
                && let Err(e) = requester.send(&frame)
            {
                debug!(connection_id = %requester.id, error = %e, "Failed to send availability");
            }
        }
    }

    fn close_all(&mut self) {
        for id in self.registry.ids() {
            if let Some(entry) = self.registry.unregister(id) {
                entry.close();
            }
        }
        for (_, pending) in self.unidentified.drain() {
            pending.sink.close();
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    fn on_frame(&mut self, id: ConnectionId, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Ignoring malformed frame");
                return;
            }
        };

        let now = now();
        let role = match self.registry.get_mut(id) {
            Some(entry) => {
                entry.last_activity = now;
                Some(entry.role)
            }
            None => None,
        };

        match frame {
            Frame::Hello(hello) => self.on_hello(id, hello),
            Frame::Control(Control::Ping { timestamp }) => self.reply_pong(id, timestamp),
            Frame::Control(Control::Pong { .. }) => {
                if let Some(entry) = self.registry.get_mut(id) {
                    let health = entry.heartbeat.on_pong(now);
                    debug!(connection_id = %id, %health, "Pong received");
                }
            }
            Frame::Control(control) => {
                debug!(connection_id = %id, ?control, "Ignoring control frame");
            }
            Frame::Fetch(request) => self.on_fetch(id, role, request, now),
            Frame::Outcome(outcome) => self.on_outcome(id, role, outcome, now),
        }
    }

    fn on_fetch(
        &mut self,
        id: ConnectionId,
        role: Option<ClientType>,
        request: FetchRequest,
        now: Instant,
    ) {
        if role != Some(ClientType::Requester) {
            warn!(connection_id = %id, request_id = %request.id, "Fetch from a non-requester ignored");
            return;
        }
        self.router
            .submit(&mut self.registry, &self.scheduler, id, request, now);
    }

    fn on_outcome(
        &mut self,
        id: ConnectionId,
        role: Option<ClientType>,
        outcome: FetchOutcome,
        now: Instant,
    ) {
        if role != Some(ClientType::Executor) {
            warn!(connection_id = %id, request_id = %outcome.id, "Outcome from a non-executor ignored");
            return;
        }
        self.router
            .on_executor_response(&mut self.registry, id, outcome, now);
    }

    fn reply_pong(&self, id: ConnectionId, timestamp: u64) {
        let sink = match self.registry.get(id) {
            Some(entry) => entry.sink(),
            None => match self.unidentified.get(&id) {
                Some(pending) => Arc::clone(&pending.sink),
                None => return,
            },
        };
        if let Err(e) = sink.send_frame(&Frame::pong(timestamp)) {
            debug!(connection_id = %id, error = %e, "Failed to send pong");
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn send_pings(&mut self) {
        let timeout = self.config.heartbeat.timeout;
        let now = now();

        for id in self.registry.ids() {
            let Some(entry) = self.registry.get_mut(id) else {
                continue;
            };
            if !entry.is_open() {
                continue;
            }

            let seq = entry.heartbeat.begin_ping(now);
            if let Err(e) = entry.send(&Frame::ping()) {
                debug!(connection_id = %id, error = %e, "Failed to send ping");
            }
            let deadline = BrokerEvent::PongTimeout { id, seq };
            entry
                .heartbeat
                .arm_timeout(timer::schedule(&self.scheduler.0, timeout, deadline));
        }
    }

    fn on_pong_timeout(&mut self, id: ConnectionId, seq: u64) {
        let max_missed = self.config.heartbeat.max_missed;
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };

        match entry.heartbeat.on_timeout(seq, max_missed) {
            None => {}
            Some(Health::Critical) => {
                warn!(
                    connection_id = %id,
                    missed = entry.heartbeat.missed_count(),
                    "Heartbeat critical, terminating connection"
                );
                self.disconnect(id, "heartbeat critical");
            }
            Some(health) => {
                warn!(
                    connection_id = %id,
                    %health,
                    missed = entry.heartbeat.missed_count(),
                    "Pong overdue"
                );
            }
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    fn stats(&self) -> BrokerStats {
        let now = now();
        BrokerStats {
            uptime: now.saturating_duration_since(self.started_at),
            connections: self.registry.stats(),
            requesters: self.registry.count(ClientType::Requester),
            executors: self.registry.count(ClientType::Executor),
            unidentified: self.unidentified.len(),
            router: self.router.stats(),
            snapshots: self.registry.snapshots(now),
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        info!(
            uptime_secs = stats.uptime.as_secs(),
            requesters = stats.requesters,
            executors = stats.executors,
            unidentified = stats.unidentified,
            in_flight = stats.router.in_flight,
            queued = stats.router.queued,
            total = stats.router.total_requests,
            succeeded = stats.router.succeeded,
            failed = stats.router.failed,
            "Broker stats"
        );
        for snapshot in &stats.snapshots {
            debug!(
                connection_id = %snapshot.id,
                role = %snapshot.role,
                health = %snapshot.health,
                processed = snapshot.stats.requests_processed,
                avg_response_ms = snapshot.stats.avg_response_time_ms.unwrap_or_default(),
                idle_secs = snapshot.idle_for.as_secs(),
                "Connection stats"
            );
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Current time on the tokio clock, so paused-time tests see it advance.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::transport::mock::{MockPeer, MockSink};

    fn config() -> BrokerConfig {
        BrokerConfig::new()
            .with_port(0)
            .with_stats_interval(None)
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_heartbeat_timeout(Duration::from_secs(10))
    }

    struct Peer {
        sink: Arc<MockSink>,
        frames: MockPeer,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    }

    impl Peer {
        fn send(&self, frame: Frame) {
            let text = frame.to_text().expect("serialize");
            self.inbound
                .send(TransportEvent::Frame(text))
                .expect("broker listening");
        }

        fn send_raw(&self, text: &str) {
            self.inbound
                .send(TransportEvent::Frame(text.to_string()))
                .expect("broker listening");
        }
    }

    fn attach_peer(broker: &BrokerHandle) -> Peer {
        let (sink, frames) = MockSink::new();
        let (inbound, events) = mpsc::unbounded_channel();
        broker.attach(sink.clone(), events);
        Peer {
            sink,
            frames,
            inbound,
        }
    }

    /// Attaches a peer and completes its handshake.
    async fn identified_peer(broker: &BrokerHandle, role: ClientType) -> Peer {
        let mut peer = attach_peer(broker);
        assert_eq!(peer.frames.next_frame().await, Frame::identify());
        peer.send(Frame::hello(role));
        assert_eq!(peer.frames.next_frame().await, Frame::identified());
        peer
    }

    fn outcome(frame: Frame) -> FetchOutcome {
        match frame {
            Frame::Outcome(outcome) => outcome,
            other => panic!("expected outcome, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_and_availability() {
        let broker = Broker::start_detached(config()).expect("start");

        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(false));

        let _executor = identified_peer(&broker, ClientType::Executor).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.requesters, 1);
        assert_eq!(stats.executors, 1);
        assert_eq!(stats.unidentified, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_round_trip() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("r2"),
            "https://a.test",
            json!({}),
        )));

        let routed = match executor.frames.next_non_heartbeat().await {
            Frame::Fetch(request) => request,
            other => panic!("expected fetch, got {other:?}"),
        };
        assert_eq!(routed.id.as_str(), "r2");

        executor.send(Frame::Outcome(FetchOutcome::success(
            routed.id,
            json!({"status": 200}),
        )));

        let forwarded = outcome(requester.frames.next_non_heartbeat().await);
        assert_eq!(forwarded.id.as_str(), "r2");
        assert_eq!(forwarded.response, Some(json!({"status": 200})));

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.router.succeeded, 1);
        assert_eq!(stats.router.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_echoing_url_is_forwarded() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("r7"),
            "https://a.test",
            json!({}),
        )));
        assert!(matches!(
            executor.frames.next_non_heartbeat().await,
            Frame::Fetch(_)
        ));

        executor.send_raw(
            r#"{"id":"r7","url":"https://a.test","options":{},"response":{"status":201}}"#,
        );

        let forwarded = outcome(requester.frames.next_non_heartbeat().await);
        assert_eq!(forwarded.id.as_str(), "r7");
        assert_eq!(forwarded.response, Some(json!({"status": 201})));

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.router.succeeded, 1);
        assert_eq!(stats.router.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_executor_scenario() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(false));

        let start = tokio::time::Instant::now();
        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("r1"),
            "https://a.test",
            json!({}),
        )));

        let failed = outcome(requester.frames.next_non_heartbeat().await);
        assert_eq!(failed.id.as_str(), "r1");
        assert_eq!(
            failed.error_message().as_deref(),
            Some("No extension clients available after maximum retries")
        );
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_arrival_promotes_queued_request() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        requester.frames.next_frame().await;

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("early"),
            "https://a.test",
            json!({}),
        )));
        tokio::time::sleep(Duration::from_secs(3)).await;

        let mut executor = identified_peer(&broker, ClientType::Executor).await;
        match executor.frames.next_non_heartbeat().await {
            Frame::Fetch(request) => assert_eq!(request.id.as_str(), "early"),
            other => panic!("expected fetch, got {other:?}"),
        }

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.router.queued, 0);
        assert_eq!(stats.router.in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_terminated_after_max_missed() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;

        // Three unanswered pings at 30s intervals, each timing out after 10s
        for _ in 0..3 {
            assert!(matches!(
                executor.frames.next_frame().await,
                Frame::Control(Control::Ping { .. })
            ));
        }
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(!executor.sink.is_open());
        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.executors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_peer_healthy() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;

        for _ in 0..5 {
            match executor.frames.next_frame().await {
                Frame::Control(Control::Ping { timestamp }) => {
                    executor.send(Frame::pong(timestamp));
                }
                other => panic!("expected ping, got {other:?}"),
            }
        }

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.executors, 1);
        assert_eq!(stats.snapshots[0].health, Health::Healthy);
        assert!(executor.sink.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_answers_ping() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        requester.frames.next_frame().await;

        requester.send(Frame::Control(Control::Ping { timestamp: 42 }));
        assert_eq!(requester.frames.next_frame().await, Frame::pong(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_ignored() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        requester.frames.next_frame().await;

        requester.send_raw("not json");
        requester.send_raw("[1,2,3]");
        requester.send_raw(r#"{"unexpected":true}"#);

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.requesters, 1);
        assert!(requester.frames.try_next_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_disconnect_fails_in_flight_and_announces() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("r9"),
            "https://a.test",
            json!({}),
        )));
        assert!(matches!(
            executor.frames.next_non_heartbeat().await,
            Frame::Fetch(_)
        ));
        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.router.in_flight, 1);

        executor
            .inbound
            .send(TransportEvent::Closed)
            .expect("broker listening");

        let mut saw_unavailable = false;
        let mut saw_failure = false;
        while !(saw_unavailable && saw_failure) {
            match requester.frames.next_non_heartbeat().await {
                Frame::Control(Control::ExtensionUnavailable) => saw_unavailable = true,
                Frame::Outcome(outcome) => {
                    assert_eq!(outcome.id.as_str(), "r9");
                    assert_eq!(outcome.error_message().as_deref(), Some("Connection closed"));
                    saw_failure = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_before_handshake_ignored() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut peer = attach_peer(&broker);
        assert_eq!(peer.frames.next_frame().await, Frame::identify());

        peer.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("sneaky"),
            "https://a.test",
            json!({}),
        )));

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.unidentified, 1);
        assert_eq!(stats.router.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_change_disconnects_and_fails_in_flight() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;
        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("rx"),
            "https://a.test",
            json!({}),
        )));
        assert!(matches!(
            executor.frames.next_non_heartbeat().await,
            Frame::Fetch(_)
        ));

        executor.send(Frame::hello(ClientType::Requester));
        executor.send(Frame::Outcome(FetchOutcome::success(
            RequestId::new("rx"),
            json!({"status": 200}),
        )));

        let failed = outcome(requester.frames.next_non_heartbeat().await);
        assert_eq!(failed.id.as_str(), "rx");
        assert_eq!(failed.error_message().as_deref(), Some("Connection closed"));
        assert_eq!(
            requester.frames.next_non_heartbeat().await,
            Frame::availability(false)
        );

        assert!(!executor.sink.is_open());
        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.executors, 0);
        assert_eq!(stats.requesters, 1);
        assert_eq!(stats.router.in_flight, 0);
        assert_eq!(stats.connections.reconnections, 0);
        assert!(requester.frames.try_next_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_handshake_same_role_is_acknowledged() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut executor = identified_peer(&broker, ClientType::Executor).await;

        executor.send(Frame::hello(ClientType::Executor));
        assert_eq!(executor.frames.next_frame().await, Frame::identified());

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.executors, 1);
        assert_eq!(stats.connections.total_connections, 1);
        assert_eq!(stats.connections.reconnections, 0);
        assert!(executor.sink.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_reconnect_replaces_stale_executor() {
        let broker = Broker::start_detached(config()).expect("start");
        let hello = Frame::Hello(Hello::new(ClientType::Executor).with_instance_id("ext-1"));

        let mut stale = attach_peer(&broker);
        assert_eq!(stale.frames.next_frame().await, Frame::identify());
        stale.send(hello.clone());
        assert_eq!(stale.frames.next_frame().await, Frame::identified());

        let mut requester = identified_peer(&broker, ClientType::Requester).await;
        assert_eq!(requester.frames.next_frame().await, Frame::availability(true));

        requester.send(Frame::Fetch(FetchRequest::new(
            RequestId::new("r5"),
            "https://a.test",
            json!({}),
        )));
        assert!(matches!(stale.frames.next_non_heartbeat().await, Frame::Fetch(_)));

        let mut fresh = attach_peer(&broker);
        assert_eq!(fresh.frames.next_frame().await, Frame::identify());
        fresh.send(hello);
        assert_eq!(fresh.frames.next_frame().await, Frame::identified());

        let failed = outcome(requester.frames.next_non_heartbeat().await);
        assert_eq!(failed.id.as_str(), "r5");
        assert_eq!(failed.error_message().as_deref(), Some("Connection closed"));

        assert!(!stale.sink.is_open());
        assert!(fresh.sink.is_open());
        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.executors, 1);
        assert_eq!(stats.connections.total_connections, 2);
        assert_eq!(stats.connections.reconnections, 1);
        assert_eq!(stats.router.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_socket_closed_after_handshake_timeout() {
        let broker = Broker::start_detached(config()).expect("start");
        let mut peer = attach_peer(&broker);
        assert_eq!(peer.frames.next_frame().await, Frame::identify());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(peer.sink.is_open());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!peer.sink.is_open());
        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.unidentified, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connections() {
        let broker = Broker::start_detached(config()).expect("start");
        let requester = identified_peer(&broker, ClientType::Requester).await;

        broker.shutdown().await;
        assert!(!requester.sink.is_open());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = BrokerConfig::new().with_queue_retry_delay(Duration::ZERO);
        assert!(matches!(
            Broker::start(config).await,
            Err(Error::Config { .. })
        ));
    }
}
