//! Requester client.
//!
//! [`RelayClient`] is a handle; the state lives in a task that owns the
//! link to the broker, the pending-call table and the outbound queue. A call
//! moves through these states:
//!
//! ```text
//!            not ready                      ready
//! fetch() ───────────► queued ──drain──► pending ──outcome──► resolved
//!    │                   │                  │  ▲
//!    │ ready             │ give-up          │  └── per-attempt timeout (fresh id)
//!    └──────────────► pending               │
//!                        │                  └── link closed ──► ConnectionClosed
//!                        └── write failed ──► delayed ──► pending or queued
//! ```
//!
//! "Ready" means the link is open, the broker has acknowledged the
//! handshake, and the broker has reported an executor.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::heartbeat::{Health, HeartbeatState};
use crate::identifiers::RequestId;
use crate::protocol::{
    ClientType, Control, Cookie, FetchOutcome, FetchRequest, FetchResponse, Frame, wants_cookiejar,
};
use crate::timer::{self, TimerHandle};
use crate::transport::{Connector, FrameSink, TransportEvent, TransportLink, WsConnector};

use super::cookies::CookieStore;
use super::options::ClientOptions;

// ============================================================================
// ClientStatus
// ============================================================================

/// Snapshot of the client's link and tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatus {
    /// The transport is open.
    pub connected: bool,
    /// The broker acknowledged the handshake.
    pub identified: bool,
    /// The broker reported at least one executor.
    pub executor_available: bool,
    /// Calls sent and awaiting an outcome.
    pub pending: usize,
    /// Calls not yet sent.
    pub queued: usize,
    /// Consecutive failed reconnect attempts.
    pub reconnect_attempts: u32,
}

impl ClientStatus {
    /// Whether a call would be sent immediately.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connected && self.identified && self.executor_available
    }
}

// ============================================================================
// RelayClient
// ============================================================================

/// Handle to a requester client.
///
/// Connecting starts immediately on construction and is retried in the
/// background. Dropping the handle shuts the client down.
///
/// # Example
///
/// ```no_run
/// use fetch_relay::{ClientOptions, RelayClient};
/// use serde_json::json;
///
/// # async fn example() -> fetch_relay::Result<()> {
/// let client = RelayClient::connect("ws://127.0.0.1:8080", ClientOptions::default())?;
///
/// let response = client
///     .fetch("https://example.com", json!({"method": "GET", "cookiejar": true}))
///     .await?;
/// println!("status {:?}", response.status());
///
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RelayClient {
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    cookies: Arc<Mutex<CookieStore>>,
    status: Arc<Mutex<ClientStatus>>,
}

impl RelayClient {
    /// Starts a client that dials the broker at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn connect(url: impl Into<String>, options: ClientOptions) -> Result<Self> {
        Self::with_connector(WsConnector::new(url), options)
    }

    /// Starts a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn with_connector(connector: impl Connector, options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cookies = Arc::new(Mutex::new(CookieStore::new()));
        let status = Arc::new(Mutex::new(ClientStatus::default()));

        let core = ClientCore::new(
            options,
            Arc::new(connector),
            events_tx.clone(),
            Arc::clone(&cookies),
            Arc::clone(&status),
        );
        tokio::spawn(core.run(events_rx));

        Ok(Self {
            events_tx,
            cookies,
            status,
        })
    }

    /// Relays a fetch through the broker.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] if the executor reported an error
    /// - [`Error::NoExecutorAvailable`], [`Error::DispatchFailed`] or
    ///   [`Error::ConnectionClosed`] if the broker failed the request
    /// - [`Error::RequestTimeout`] if the call gave up waiting in the queue
    /// - [`Error::MaxRetriesExceeded`] if every attempt timed out
    /// - [`Error::ConnectionClosed`] if the link dropped while the call was
    ///   outstanding, or the client is shut down
    /// - [`Error::IdentificationFailed`] if the broker never acknowledged
    pub async fn fetch(&self, url: impl Into<String>, options: Value) -> Result<FetchResponse> {
        let (reply, rx) = oneshot::channel();
        let call = Call {
            url: url.into(),
            options,
            retry_count: 0,
            reply,
        };

        self.events_tx
            .send(ClientEvent::Fetch(call))
            .map_err(|_| Error::ConnectionClosed)?;

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Calls awaiting an outcome.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.status.lock().pending
    }

    /// Calls not yet sent.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.status.lock().queued
    }

    /// Whether a call would be sent immediately.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.lock().is_ready()
    }

    /// Full status snapshot.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.status.lock()
    }

    /// Cookies recorded for the URL's host.
    #[must_use]
    pub fn cookies(&self, url: &str) -> Vec<Cookie> {
        self.cookies.lock().get(url)
    }

    /// Replaces the cookies recorded for the URL's host.
    pub fn set_cookies(&self, url: &str, cookies: Vec<Cookie>) {
        self.cookies.lock().set(url, cookies);
    }

    /// Forgets all recorded cookies.
    pub fn clear_cookies(&self) {
        self.cookies.lock().clear();
    }

    /// Rejects every outstanding call with [`Error::ConnectionClosed`],
    /// closes the link and waits for the client task to stop.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self
            .events_tx
            .send(ClientEvent::Shutdown { done: Some(done) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        let _ = self.events_tx.send(ClientEvent::Shutdown { done: None });
    }
}

// ============================================================================
// Events & Calls
// ============================================================================

/// Everything the client task reacts to.
enum ClientEvent {
    Fetch(Call),
    Connected { generation: u64, link: TransportLink },
    ConnectFailed { generation: u64, error: Error },
    Transport { generation: u64, event: TransportEvent },
    ReconnectDue,
    IdentifyTimeout { generation: u64, attempt: u32 },
    PongTimeout { generation: u64, seq: u64 },
    AttemptTimeout { id: RequestId },
    SendRetryDue { ticket: u64 },
    GiveUp { ticket: u64 },
    Shutdown { done: Option<oneshot::Sender<()>> },
}

/// One `fetch` invocation, carried through every retry.
struct Call {
    url: String,
    options: Value,
    retry_count: u32,
    reply: oneshot::Sender<Result<FetchResponse>>,
}

impl Call {
    fn resolve(self, result: Result<FetchResponse>) {
        let _ = self.reply.send(result);
    }
}

/// A sent call awaiting its outcome.
struct PendingCall {
    call: Call,
    _timeout: TimerHandle,
}

/// A call waiting for the link to become ready.
struct QueuedCall {
    ticket: u64,
    call: Call,
    _give_up: TimerHandle,
}

/// A call waiting out the send-retry delay.
struct DelayedCall {
    call: Call,
    _timer: TimerHandle,
}

/// State of the link to the broker.
enum Link {
    /// Not connected and nothing scheduled.
    Idle,
    /// A connect attempt is running.
    Connecting,
    /// A reconnect is scheduled.
    Backoff(TimerHandle),
    /// Connected.
    Up(Arc<dyn FrameSink>),
}

// ============================================================================
// ClientCore
// ============================================================================

struct ClientCore {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    cookies: Arc<Mutex<CookieStore>>,
    status: Arc<Mutex<ClientStatus>>,

    link: Link,
    /// Bumped for every connect attempt and every link loss; events from
    /// older links are ignored.
    generation: u64,
    identified: bool,
    executor_available: bool,
    identify_timer: Option<TimerHandle>,
    heartbeat: HeartbeatState,
    reconnect_attempts: u32,

    pending: FxHashMap<RequestId, PendingCall>,
    queue: VecDeque<QueuedCall>,
    delayed: FxHashMap<u64, DelayedCall>,
    next_ticket: u64,
}

impl ClientCore {
    fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        events_tx: mpsc::UnboundedSender<ClientEvent>,
        cookies: Arc<Mutex<CookieStore>>,
        status: Arc<Mutex<ClientStatus>>,
    ) -> Self {
        Self {
            options,
            connector,
            events_tx,
            cookies,
            status,
            link: Link::Idle,
            generation: 0,
            identified: false,
            executor_available: false,
            identify_timer: None,
            heartbeat: HeartbeatState::new(),
            reconnect_attempts: 0,
            pending: FxHashMap::default(),
            queue: VecDeque::new(),
            delayed: FxHashMap::default(),
            next_ticket: 0,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        let mut heartbeat = ticker(self.options.heartbeat.interval);
        let mut queue_drain = ticker(self.options.queue_check_interval);

        self.start_connect();
        self.publish_status();

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ClientEvent::Shutdown { done }) => {
                            self.shutdown();
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            break;
                        }
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }

                _ = heartbeat.tick() => self.send_ping(),

                _ = queue_drain.tick() => self.drain_queue(),
            }
            self.publish_status();
        }

        debug!("Client task terminated");
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Fetch(call) => self.send(call),
            ClientEvent::Connected { generation, link } => self.on_connected(generation, link),
            ClientEvent::ConnectFailed { generation, error } => {
                if generation == self.generation {
                    warn!(error = %error, "Failed to connect to broker");
                    self.schedule_reconnect();
                }
            }
            ClientEvent::Transport { generation, event } => {
                if generation != self.generation {
                    return;
                }
                match event {
                    TransportEvent::Frame(text) => self.on_frame(&text),
                    TransportEvent::Closed => self.on_link_lost("transport closed"),
                }
            }
            ClientEvent::ReconnectDue => {
                if matches!(self.link, Link::Backoff(_)) {
                    self.start_connect();
                }
            }
            ClientEvent::IdentifyTimeout {
                generation,
                attempt,
            } => self.on_identify_timeout(generation, attempt),
            ClientEvent::PongTimeout { generation, seq } => self.on_pong_timeout(generation, seq),
            ClientEvent::AttemptTimeout { id } => self.on_attempt_timeout(&id),
            ClientEvent::SendRetryDue { ticket } => {
                if let Some(delayed) = self.delayed.remove(&ticket) {
                    self.send(delayed.call);
                }
            }
            ClientEvent::GiveUp { ticket } => self.on_give_up(ticket),
            ClientEvent::Shutdown { .. } => {}
        }
    }

    // ========================================================================
    // Link
    // ========================================================================

    fn sink(&self) -> Option<&Arc<dyn FrameSink>> {
        match &self.link {
            Link::Up(sink) => Some(sink),
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.sink().is_some_and(|sink| sink.is_open())
    }

    fn is_ready(&self) -> bool {
        self.is_connected() && self.identified && self.executor_available
    }

    fn start_connect(&mut self) {
        self.generation += 1;
        self.link = Link::Connecting;

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let events_tx = self.events_tx.clone();

        debug!(generation, attempt = self.reconnect_attempts, "Connecting to broker");
        tokio::spawn(async move {
            let event = match connector.connect().await {
                Ok(link) => ClientEvent::Connected { generation, link },
                Err(error) => ClientEvent::ConnectFailed { generation, error },
            };
            let _ = events_tx.send(event);
        });
    }

    /// Connects if nothing is connected, connecting or scheduled.
    fn ensure_connecting(&mut self) {
        if matches!(self.link, Link::Idle) {
            self.reconnect_attempts = 0;
            self.start_connect();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.options.max_reconnect_attempts {
            error!(
                attempts = self.options.max_reconnect_attempts,
                "Giving up reconnecting to broker"
            );
            self.link = Link::Idle;
            return;
        }

        let delay = self.options.reconnect_delay(self.reconnect_attempts);
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.link = Link::Backoff(timer::schedule(&self.events_tx, delay, ClientEvent::ReconnectDue));
    }

    fn on_connected(&mut self, generation: u64, link: TransportLink) {
        if generation != self.generation {
            link.sink.close();
            return;
        }

        info!(generation, "Connected to broker");
        self.reconnect_attempts = 0;
        self.identified = false;
        self.executor_available = false;
        self.heartbeat = HeartbeatState::new();
        self.link = Link::Up(Arc::clone(&link.sink));

        self.spawn_forwarder(generation, link.events);
        self.send_hello(1);
    }

    fn spawn_forwarder(&self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = event == TransportEvent::Closed;
                if events_tx
                    .send(ClientEvent::Transport { generation, event })
                    .is_err()
                    || closed
                {
                    return;
                }
            }
            let _ = events_tx.send(ClientEvent::Transport {
                generation,
                event: TransportEvent::Closed,
            });
        });
    }

    /// Tears down the current link and fails everything in flight on it.
    fn on_link_lost(&mut self, reason: &str) {
        if let Some(sink) = self.sink() {
            sink.close();
        }
        self.generation += 1;
        self.link = Link::Idle;
        self.identified = false;
        self.executor_available = false;
        self.identify_timer = None;
        self.heartbeat = HeartbeatState::new();

        let failed = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.call.resolve(Err(Error::ConnectionClosed));
        }
        warn!(reason, failed, "Lost connection to broker");

        self.schedule_reconnect();
    }

    fn shutdown(&mut self) {
        if let Some(sink) = self.sink() {
            sink.close();
        }
        self.generation += 1;
        self.link = Link::Idle;
        self.identify_timer = None;

        for (_, pending) in self.pending.drain() {
            pending.call.resolve(Err(Error::ConnectionClosed));
        }
        for queued in self.queue.drain(..) {
            queued.call.resolve(Err(Error::ConnectionClosed));
        }
        for (_, delayed) in self.delayed.drain() {
            delayed.call.resolve(Err(Error::ConnectionClosed));
        }
        info!("Client shut down");
    }

    // ========================================================================
    // Identification
    // ========================================================================

    fn send_hello(&mut self, attempt: u32) {
        let Some(sink) = self.sink() else {
            return;
        };
        if let Err(e) = sink.send_frame(&Frame::hello(ClientType::Requester)) {
            warn!(error = %e, "Failed to send handshake");
        }

        let generation = self.generation;
        self.identify_timer = Some(timer::schedule(
            &self.events_tx,
            self.options.identify_timeout,
            ClientEvent::IdentifyTimeout {
                generation,
                attempt,
            },
        ));
    }

    fn on_identify_timeout(&mut self, generation: u64, attempt: u32) {
        if generation != self.generation || self.identified {
            return;
        }

        if attempt < self.options.identify_attempts {
            warn!(attempt, "Broker did not acknowledge handshake, retrying");
            self.send_hello(attempt + 1);
            return;
        }

        self.identify_timer = None;
        error!(attempts = attempt, "Identification with broker failed");
        for queued in self.queue.drain(..) {
            queued
                .call
                .resolve(Err(Error::IdentificationFailed { attempts: attempt }));
        }
        self.on_link_lost("identification failed");
    }

    // ========================================================================
    // Inbound Frames
    // ========================================================================

    fn on_frame(&mut self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame from broker");
                return;
            }
        };

        match frame {
            Frame::Control(Control::Identify) => {
                debug!("Broker requested identification");
                if let Some(sink) = self.sink()
                    && let Err(e) = sink.send_frame(&Frame::hello(ClientType::Requester))
                {
                    warn!(error = %e, "Failed to send handshake");
                }
            }
            Frame::Control(Control::Identified) => {
                info!("Identified with broker");
                self.identified = true;
                self.identify_timer = None;
                self.drain_queue();
            }
            Frame::Control(Control::ExtensionAvailable) => {
                info!("Executor available");
                self.executor_available = true;
                self.drain_queue();
            }
            Frame::Control(Control::ExtensionUnavailable) => {
                info!("No executor available");
                self.executor_available = false;
            }
            Frame::Control(Control::Ping { timestamp }) => {
                if let Some(sink) = self.sink()
                    && let Err(e) = sink.send_frame(&Frame::pong(timestamp))
                {
                    debug!(error = %e, "Failed to send pong");
                }
            }
            Frame::Control(Control::Pong { .. }) => {
                let health = self.heartbeat.on_pong(tokio::time::Instant::now().into_std());
                debug!(%health, "Broker pong");
            }
            Frame::Outcome(outcome) => self.on_outcome(outcome),
            Frame::Hello(_) | Frame::Fetch(_) => {
                warn!("Ignoring unexpected frame from broker");
            }
        }
    }

    fn on_outcome(&mut self, outcome: FetchOutcome) {
        let Some(pending) = self.pending.remove(&outcome.id) else {
            debug!(request_id = %outcome.id, "Dropping outcome for unknown request");
            return;
        };

        let request_id = outcome.id.clone();
        let result = outcome.into_result();

        if let Ok(response) = &result
            && let Some(cookies) = response.cookies()
        {
            self.cookies.lock().set(&pending.call.url, cookies);
        }

        debug!(request_id = %request_id, ok = result.is_ok(), "Call completed");
        pending.call.resolve(result);
    }

    // ========================================================================
    // Send Path
    // ========================================================================

    fn send(&mut self, mut call: Call) {
        if !self.is_ready() {
            self.enqueue(call);
            return;
        }
        let Some(sink) = self.sink().cloned() else {
            self.enqueue(call);
            return;
        };

        let id = RequestId::generate();
        let mut options = call.options.clone();
        if wants_cookiejar(&options)
            && let Some(map) = options.as_object_mut()
        {
            let cookies = self.cookies.lock().get(&call.url);
            match serde_json::to_value(cookies) {
                Ok(value) => {
                    map.insert("cookies".to_string(), value);
                }
                Err(e) => warn!(error = %e, "Failed to attach cookies"),
            }
        }

        let frame = Frame::Fetch(FetchRequest::new(id.clone(), call.url.clone(), options));
        match sink.send_frame(&frame) {
            Ok(()) => {
                debug!(request_id = %id, url = %call.url, retry = call.retry_count, "Call sent");
                let timeout = timer::schedule(
                    &self.events_tx,
                    self.options.timeout,
                    ClientEvent::AttemptTimeout { id: id.clone() },
                );
                self.pending.insert(
                    id,
                    PendingCall {
                        call,
                        _timeout: timeout,
                    },
                );
            }
            Err(e) if call.retry_count < self.options.max_retries => {
                warn!(url = %call.url, retry = call.retry_count, error = %e, "Send failed, retrying");
                call.retry_count += 1;
                let ticket = self.ticket();
                let timer = timer::schedule(
                    &self.events_tx,
                    self.options.send_retry_delay,
                    ClientEvent::SendRetryDue { ticket },
                );
                self.delayed.insert(
                    ticket,
                    DelayedCall {
                        call,
                        _timer: timer,
                    },
                );
            }
            Err(e) => {
                error!(url = %call.url, error = %e, "Send failed, retries exhausted");
                let attempts = call.retry_count + 1;
                call.resolve(Err(Error::max_retries(attempts)));
            }
        }
    }

    fn on_attempt_timeout(&mut self, id: &RequestId) {
        let Some(pending) = self.pending.remove(id) else {
            return;
        };
        let mut call = pending.call;

        if call.retry_count < self.options.max_retries {
            warn!(request_id = %id, retry = call.retry_count, "Call timed out, retrying");
            call.retry_count += 1;
            self.send(call);
        } else {
            error!(request_id = %id, url = %call.url, "Call timed out, retries exhausted");
            let attempts = call.retry_count + 1;
            call.resolve(Err(Error::max_retries(attempts)));
        }
    }

    // ========================================================================
    // Outbound Queue
    // ========================================================================

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn enqueue(&mut self, call: Call) {
        let ticket = self.ticket();
        let give_up = timer::schedule(
            &self.events_tx,
            self.options.timeout,
            ClientEvent::GiveUp { ticket },
        );
        debug!(url = %call.url, retry = call.retry_count, "Call queued");
        self.queue.push_back(QueuedCall {
            ticket,
            call,
            _give_up: give_up,
        });
        self.ensure_connecting();
    }

    fn on_give_up(&mut self, ticket: u64) {
        let Some(index) = self.queue.iter().position(|q| q.ticket == ticket) else {
            return;
        };
        let Some(queued) = self.queue.remove(index) else {
            return;
        };

        let operation = if !self.is_connected() {
            "waiting for broker connection"
        } else if !self.identified {
            "waiting for broker identification"
        } else if !self.executor_available {
            "waiting for an extension client"
        } else {
            "waiting in the request queue"
        };

        warn!(url = %queued.call.url, operation, "Queued call gave up");
        queued
            .call
            .resolve(Err(Error::request_timeout(operation, self.options.timeout_ms())));
    }

    /// Sends every queued call if the link is ready.
    fn drain_queue(&mut self) {
        if self.queue.is_empty() || !self.is_ready() {
            return;
        }

        let drained: Vec<QueuedCall> = self.queue.drain(..).collect();
        debug!(count = drained.len(), "Draining queue");
        for queued in drained {
            self.send(queued.call);
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn send_ping(&mut self) {
        let Some(sink) = self.sink().cloned() else {
            return;
        };

        let seq = self.heartbeat.begin_ping(tokio::time::Instant::now().into_std());
        if let Err(e) = sink.send_frame(&Frame::ping()) {
            debug!(error = %e, "Failed to send ping");
        }

        let generation = self.generation;
        self.heartbeat.arm_timeout(timer::schedule(
            &self.events_tx,
            self.options.heartbeat.timeout,
            ClientEvent::PongTimeout { generation, seq },
        ));
    }

    fn on_pong_timeout(&mut self, generation: u64, seq: u64) {
        if generation != self.generation {
            return;
        }

        match self.heartbeat.on_timeout(seq, self.options.heartbeat.max_missed) {
            None => {}
            Some(Health::Critical) => self.on_link_lost("broker heartbeat critical"),
            Some(health) => {
                warn!(%health, missed = self.heartbeat.missed_count(), "Broker pong overdue");
            }
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn publish_status(&self) {
        *self.status.lock() = ClientStatus {
            connected: self.is_connected(),
            identified: self.identified,
            executor_available: self.executor_available,
            pending: self.pending.len(),
            queued: self.queue.len() + self.delayed.len(),
            reconnect_attempts: self.reconnect_attempts,
        };
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::transport::mock::{MockPeer, MockSink};

    // ------------------------------------------------------------------------
    // Scripted broker
    // ------------------------------------------------------------------------

    /// The broker end of one client connection.
    struct FakeBroker {
        sink: Arc<MockSink>,
        frames: MockPeer,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    }

    impl FakeBroker {
        fn send(&self, frame: Frame) {
            let text = frame.to_text().expect("serialize");
            let _ = self.inbound.send(TransportEvent::Frame(text));
        }

        fn close(&self) {
            self.sink.close();
            let _ = self.inbound.send(TransportEvent::Closed);
        }

        async fn expect_hello(&mut self) {
            match self.frames.next_non_heartbeat().await {
                Frame::Hello(hello) => assert_eq!(hello.client_type, ClientType::Requester),
                other => panic!("expected hello, got {other:?}"),
            }
        }

        /// Completes the handshake and reports an executor.
        async fn accept(&mut self) {
            self.expect_hello().await;
            self.send(Frame::identified());
            self.send(Frame::availability(true));
        }

        async fn next_fetch(&mut self) -> FetchRequest {
            match self.frames.next_non_heartbeat().await {
                Frame::Fetch(request) => request,
                other => panic!("expected fetch, got {other:?}"),
            }
        }
    }

    struct MockConnector {
        brokers: mpsc::UnboundedSender<FakeBroker>,
        failures: AtomicU32,
        attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<TransportLink> {
            self.attempts.lock().push(tokio::time::Instant::now());

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::connection("refused"));
            }

            let (sink, frames) = MockSink::new();
            let (inbound, events) = mpsc::unbounded_channel();
            let _ = self.brokers.send(FakeBroker {
                sink: sink.clone(),
                frames,
                inbound,
            });
            Ok(TransportLink { sink, events })
        }
    }

    struct Harness {
        client: RelayClient,
        brokers: mpsc::UnboundedReceiver<FakeBroker>,
        attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    impl Harness {
        fn start(options: ClientOptions, failures: u32) -> Self {
            let (tx, brokers) = mpsc::unbounded_channel();
            let attempts = Arc::new(Mutex::new(Vec::new()));
            let connector = MockConnector {
                brokers: tx,
                failures: AtomicU32::new(failures),
                attempts: Arc::clone(&attempts),
            };
            let client = RelayClient::with_connector(connector, options).expect("valid options");
            Self {
                client,
                brokers,
                attempts,
            }
        }

        async fn broker(&mut self) -> FakeBroker {
            self.brokers.recv().await.expect("connect attempt")
        }

        async fn ready_broker(&mut self) -> FakeBroker {
            let mut broker = self.broker().await;
            broker.accept().await;
            settle().await;
            broker
        }
    }

    fn options() -> ClientOptions {
        ClientOptions::new()
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(2)
            .with_heartbeat_interval(Duration::from_secs(600))
            .with_heartbeat_timeout(Duration::from_secs(60))
            .with_queue_check_interval(Duration::from_millis(100))
            .with_reconnect_base_delay(Duration::from_secs(1))
            .with_identify_timeout(Duration::from_secs(1))
    }

    /// Lets spawned tasks run without advancing the clock far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_fetch_resolves_with_response() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;
        assert!(harness.client.is_ready());

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let respond = async {
            let request = broker.next_fetch().await;
            broker.send(Frame::Outcome(FetchOutcome::success(
                request.id,
                json!({"status": 200}),
            )));
        };

        let (result, ()) = tokio::join!(call, respond);
        let response = result.expect("response");
        assert_eq!(response.status(), Some(200));

        settle().await;
        assert_eq!(harness.client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_queued_until_ready() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({"method": "GET"}));
        let script = async {
            broker.expect_hello().await;
            settle().await;
            assert_eq!(client.queued_count(), 1);

            broker.send(Frame::identified());
            broker.send(Frame::availability(true));

            let request = broker.next_fetch().await;
            assert_eq!(request.options, json!({"method": "GET"}));
            broker.send(Frame::Outcome(FetchOutcome::success(request.id, json!({}))));
        };

        let (result, ()) = tokio::join!(call, script);
        assert!(result.is_ok());
        assert_eq!(client.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_without_executor() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.broker().await;
        broker.expect_hello().await;
        broker.send(Frame::identified());
        broker.send(Frame::availability(false));
        settle().await;

        let start = tokio::time::Instant::now();
        let err = harness
            .client
            .fetch("https://a.test", json!({}))
            .await
            .expect_err("no executor");

        assert!(matches!(err, Error::RequestTimeout { timeout_ms: 5000, .. }));
        assert!(err.to_string().contains("waiting for an extension client"));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(harness.client.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_with_fresh_ids() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let collect = async {
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(broker.next_fetch().await.id);
            }
            ids
        };

        let (result, ids) = tokio::join!(call, collect);
        assert!(matches!(
            result,
            Err(Error::MaxRetriesExceeded { attempts: 3 })
        ));

        let mut unique = ids.clone();
        unique.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        unique.dedup();
        assert_eq!(unique.len(), 3);
        assert!(broker.frames.try_next_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcome_after_retry_is_dropped() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let script = async {
            let first = broker.next_fetch().await;
            let second = broker.next_fetch().await;
            // Answer the superseded attempt, then the live one
            broker.send(Frame::Outcome(FetchOutcome::success(first.id, json!({"n": 1}))));
            broker.send(Frame::Outcome(FetchOutcome::success(second.id, json!({"n": 2}))));
        };

        let (result, ()) = tokio::join!(call, script);
        assert_eq!(result.expect("response").body(), &json!({"n": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_error_is_remote() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let respond = async {
            let request = broker.next_fetch().await;
            broker.send(Frame::Outcome(FetchOutcome::failure(request.id, "net::ERR_FAILED")));
        };

        let (result, ()) = tokio::join!(call, respond);
        match result {
            Err(Error::Remote { message }) => assert_eq!(message, "net::ERR_FAILED"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_failure_keeps_its_variant() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let respond = async {
            let request = broker.next_fetch().await;
            broker.send(Frame::Outcome(FetchOutcome::failure(
                request.id,
                Error::NoExecutorAvailable.to_string(),
            )));
        };

        let (result, ()) = tokio::join!(call, respond);
        assert!(matches!(result, Err(Error::NoExecutorAvailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_pending_and_reconnects() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let drop_link = async {
            broker.next_fetch().await;
            broker.close();
        };

        let (result, ()) = tokio::join!(call, drop_link);
        assert!(matches!(result, Err(Error::ConnectionClosed)));

        let closed_at = tokio::time::Instant::now();
        let _second = harness.broker().await;
        assert_eq!(closed_at.elapsed(), Duration::from_secs(1));
        assert_eq!(harness.attempts.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_grows_then_stops() {
        let options = options().with_max_reconnect_attempts(7);
        let harness = Harness::start(options, u32::MAX);

        tokio::time::sleep(Duration::from_secs(120)).await;

        let attempts = harness.attempts.lock().clone();
        assert_eq!(attempts.len(), 8);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 3, 4, 5, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_connect() {
        let mut harness = Harness::start(options(), 2);

        // Attempts at 0s, 1s, 3s; the third succeeds
        let broker = harness.broker().await;
        settle().await;
        assert_eq!(harness.attempts.lock().len(), 3);
        assert_eq!(harness.client.status().reconnect_attempts, 0);

        let closed_at = tokio::time::Instant::now();
        broker.close();
        let _next = harness.broker().await;
        assert_eq!(closed_at.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identification_failure_rejects_queued() {
        let options = options().with_timeout(Duration::from_secs(30));
        let mut harness = Harness::start(options, 0);
        let mut broker = harness.broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let ignore = async {
            for _ in 0..3 {
                broker.expect_hello().await;
            }
        };

        let (result, ()) = tokio::join!(call, ignore);
        assert!(matches!(
            result,
            Err(Error::IdentificationFailed { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identification_failure_reconnects() {
        let options = options().with_timeout(Duration::from_secs(30));
        let mut harness = Harness::start(options, 0);
        let mut silent = harness.broker().await;

        let client = &harness.client;
        let first = client.fetch("https://a.test", json!({}));
        let ignore = async {
            for _ in 0..3 {
                silent.expect_hello().await;
            }
        };
        let (result, ()) = tokio::join!(first, ignore);
        assert!(matches!(
            result,
            Err(Error::IdentificationFailed { attempts: 3 })
        ));

        let failed_at = tokio::time::Instant::now();
        let mut broker = harness.broker().await;
        assert_eq!(failed_at.elapsed(), Duration::from_secs(1));
        assert!(!silent.sink.is_open());
        assert_eq!(harness.attempts.lock().len(), 2);

        broker.accept().await;
        let client = &harness.client;
        let second = client.fetch("https://a.test", json!({}));
        let respond = async {
            let request = broker.next_fetch().await;
            broker.send(Frame::Outcome(FetchOutcome::success(
                request.id,
                json!({"status": 200}),
            )));
        };
        let (result, ()) = tokio::join!(second, respond);
        assert_eq!(result.expect("response").status(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_prompt_resends_hello() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.broker().await;
        broker.expect_hello().await;

        broker.send(Frame::identify());
        broker.expect_hello().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookiejar_injects_and_updates() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;
        harness
            .client
            .set_cookies("https://a.test/", vec![Cookie::new("sid", "old")]);

        let client = &harness.client;
        let call = client.fetch("https://a.test/page", json!({"cookiejar": true}));
        let respond = async {
            let request = broker.next_fetch().await;
            assert_eq!(
                request.options["cookies"],
                json!([{"name": "sid", "value": "old"}])
            );
            broker.send(Frame::Outcome(FetchOutcome::success(
                request.id,
                json!({"status": 200, "cookies": [{"name": "sid", "value": "new"}]}),
            )));
        };

        let (result, ()) = tokio::join!(call, respond);
        assert!(result.is_ok());
        assert_eq!(
            harness.client.cookies("https://a.test/"),
            vec![Cookie::new("sid", "new")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_retries_after_delay() {
        let options = options().with_max_retries(1);
        let mut harness = Harness::start(options, 0);
        let broker = harness.ready_broker().await;
        broker.sink.fail_sends();

        let start = tokio::time::Instant::now();
        let result = harness.client.fetch("https://a.test", json!({})).await;

        assert!(matches!(
            result,
            Err(Error::MaxRetriesExceeded { attempts: 2 })
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_broker_ping() {
        let mut harness = Harness::start(options(), 0);
        let mut broker = harness.ready_broker().await;

        broker.send(Frame::Control(Control::Ping { timestamp: 7 }));
        assert_eq!(broker.frames.next_frame().await, Frame::pong(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_broker_dropped_after_max_missed() {
        let options = options()
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_heartbeat_timeout(Duration::from_secs(10));
        let mut harness = Harness::start(options, 0);
        let broker = harness.ready_broker().await;

        // Pings at 30s, 60s, 90s; third timeout at 100s
        let _next = harness.broker().await;
        assert!(!broker.sink.is_open());
        assert_eq!(harness.attempts.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_outstanding() {
        let mut harness = Harness::start(options().with_timeout(Duration::from_secs(60)), 0);
        let broker = harness.ready_broker().await;

        let client = &harness.client;
        let call = client.fetch("https://a.test", json!({}));
        let stop = async {
            settle().await;
            assert_eq!(client.pending_count(), 1);
            client.shutdown().await;
        };

        let (result, ()) = tokio::join!(call, stop);
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(!broker.sink.is_open());

        let after = client.fetch("https://a.test", json!({})).await;
        assert!(matches!(after, Err(Error::ConnectionClosed)));
    }
}
