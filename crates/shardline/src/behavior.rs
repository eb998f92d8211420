//! Client behavior: the single-threaded owner of all connections.
//!
//! The behavior multiplexes connections by backend cookie and runs the
//! event loop the rest of the core schedules onto. Response envelopes,
//! timer callbacks, and resolution results all arrive as `ClientEvent`s on
//! one unbounded channel and are applied in arrival order, so connection
//! state transitions never race each other. Producers only ever touch the
//! behavior to look up (or lazily create) a connection.
//!
//! Reconnect sequencing lives here: a Connected connection whose backend
//! went silent is drained into a fresh Connecting successor, the slot
//! keeps both until the successor resolves, and the predecessor is retired
//! once the successor is live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use shardwire::{BackendInfo, ClientIdentifier, CookieId, ResponseEnvelope};

use crate::clock::Ticker;
use crate::config::ClientConfig;
use crate::connection::{ConnectOutcome, Connection, TimerVerdict};
use crate::error::{ConnectionFailure, ResolverError};
use crate::resolver::BackendInfoResolver;
use crate::transport::MessageTransport;

/// One unit of work for the behavior's event loop.
#[derive(Debug)]
pub enum ClientEvent {
    /// Inbound response envelope from the substrate
    Response(ResponseEnvelope),
    /// A connection's armed timer fired
    RunTimer(Arc<Connection>),
    /// Backend resolution finished for `connection`'s resolve `attempt`
    BackendResolved {
        connection: Arc<Connection>,
        attempt: u32,
        result: Result<BackendInfo, ResolverError>,
    },
}

/// Shared per-client context handed to every connection: identity, clock,
/// and the way back onto the event loop.
pub struct ClientContext {
    client_id: ClientIdentifier,
    persistence_id: String,
    ticker: Arc<dyn Ticker>,
    event_tx: UnboundedSender<ClientEvent>,
}

impl ClientContext {
    pub(crate) fn new(
        client_id: ClientIdentifier,
        ticker: Arc<dyn Ticker>,
        event_tx: UnboundedSender<ClientEvent>,
    ) -> Self {
        let persistence_id = client_id.to_string();
        Self {
            client_id,
            persistence_id,
            ticker,
            event_tx,
        }
    }

    pub fn client_id(&self) -> &ClientIdentifier {
        &self.client_id
    }

    /// Stable log tag for this client instance.
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Current monotonic tick.
    pub(crate) fn now(&self) -> u64 {
        self.ticker.read()
    }

    pub(crate) fn event_sender(&self) -> UnboundedSender<ClientEvent> {
        self.event_tx.clone()
    }

    /// Schedule `event` onto the event loop after `delay_ticks`.
    pub(crate) fn execute_in_actor(&self, delay_ticks: u64, event: ClientEvent) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            if delay_ticks > 0 {
                tokio::time::sleep(Duration::from_nanos(delay_ticks)).await;
            }
            let _ = tx.send(event);
        });
    }
}

/// Active connection for a cookie, plus the reconnect successor while one
/// is being brought up.
struct ConnectionSlot {
    active: Arc<Connection>,
    successor: Option<Arc<Connection>>,
}

impl ConnectionSlot {
    fn holds(&self, connection: &Arc<Connection>) -> bool {
        Arc::ptr_eq(&self.active, connection)
            || self
                .successor
                .as_ref()
                .map_or(false, |successor| Arc::ptr_eq(successor, connection))
    }
}

/// Owner of all per-backend connections for one client.
pub struct ClientBehavior {
    config: ClientConfig,
    context: Arc<ClientContext>,
    resolver: Arc<dyn BackendInfoResolver>,
    transport: Arc<dyn MessageTransport>,
    connections: Mutex<HashMap<CookieId, ConnectionSlot>>,
    next_session_id: AtomicU64,
    events: Mutex<Option<UnboundedReceiver<ClientEvent>>>,
}

impl ClientBehavior {
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn BackendInfoResolver>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        Self::with_ticker(
            config,
            resolver,
            transport,
            Arc::new(crate::clock::MonotonicTicker::new()),
        )
    }

    /// Construct with an explicit tick source.
    pub fn with_ticker(
        config: ClientConfig,
        resolver: Arc<dyn BackendInfoResolver>,
        transport: Arc<dyn MessageTransport>,
        ticker: Arc<dyn Ticker>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client_id = ClientIdentifier::new(&config.name);
        let context = Arc::new(ClientContext::new(client_id, ticker, event_tx));
        Arc::new(Self {
            config,
            context,
            resolver,
            transport,
            connections: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
            events: Mutex::new(Some(event_rx)),
        })
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    /// Sender half of the event loop, for substrates that deliver inbound
    /// envelopes themselves.
    pub fn event_sender(&self) -> UnboundedSender<ClientEvent> {
        self.context.event_sender()
    }

    /// Connection for `cookie`, created (and its resolution started) on
    /// first use. Safe to call from any thread.
    pub fn connection(&self, cookie: CookieId) -> Arc<Connection> {
        let connection = {
            let mut connections = self.lock_connections();
            if let Some(slot) = connections.get(&cookie) {
                return slot.active.clone();
            }
            let connection =
                Connection::connecting(cookie, self.context.clone(), self.config.queue_capacity);
            connections.insert(
                cookie,
                ConnectionSlot {
                    active: connection.clone(),
                    successor: None,
                },
            );
            connection
        };
        debug!(
            "{}: new connection for {}",
            self.context.persistence_id(),
            cookie
        );
        self.spawn_resolution(connection.clone(), 0);
        connection
    }

    /// Consume events until the channel closes, then fail everything
    /// still queued. Spawn this once per client.
    pub async fn run(self: Arc<Self>) {
        let receiver = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.take()
        };
        let Some(mut receiver) = receiver else {
            warn!(
                "{}: event loop already running",
                self.context.persistence_id()
            );
            return;
        };
        info!("{}: client behavior running", self.context.persistence_id());
        while let Some(event) = receiver.recv().await {
            self.dispatch(event);
        }
        info!(
            "{}: event channel closed, shutting down",
            self.context.persistence_id()
        );
        self.poison_all(ConnectionFailure::Shutdown);
    }

    /// Apply a single event. Public so an embedding substrate can drive
    /// the loop itself instead of spawning `run`.
    pub fn dispatch(&self, event: ClientEvent) {
        match event {
            ClientEvent::Response(envelope) => self.route_response(envelope),
            ClientEvent::RunTimer(connection) => self.handle_timer(connection),
            ClientEvent::BackendResolved {
                connection,
                attempt,
                result,
            } => self.handle_resolved(connection, attempt, result),
        }
    }

    /// Terminally fail every connection, e.g. at client halt.
    pub fn poison_all(&self, cause: ConnectionFailure) {
        let slots: Vec<ConnectionSlot> = {
            let mut connections = self.lock_connections();
            connections.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            slot.active.poison(cause.clone());
            if let Some(successor) = slot.successor {
                successor.poison(cause.clone());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    fn route_response(&self, envelope: ResponseEnvelope) {
        let target = envelope.target();
        let connection = {
            let connections = self.lock_connections();
            connections.get(&target).map(|slot| slot.active.clone())
        };
        match connection {
            Some(connection) => connection.receive_response(envelope),
            None => debug!(
                "{}: dropping response for unknown backend {}",
                self.context.persistence_id(),
                target
            ),
        }
    }

    fn handle_timer(&self, connection: Arc<Connection>) {
        match connection.run_timer() {
            TimerVerdict::Continue => {}
            TimerVerdict::Reconnect => {
                self.start_reconnect(&connection, ConnectionFailure::BackendTimeout)
            }
            TimerVerdict::RetryResolve { attempt } => self.spawn_resolution(connection, attempt),
            TimerVerdict::Poisoned(cause) => self.drop_slot(&connection, cause),
        }
    }

    fn handle_resolved(
        &self,
        connection: Arc<Connection>,
        attempt: u32,
        result: Result<BackendInfo, ResolverError>,
    ) {
        match result {
            Ok(backend) => {
                let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let window = backend.max_messages;
                match connection.complete_connect(attempt, session_id, backend, self.transport.clone())
                {
                    ConnectOutcome::Connected => {
                        info!(
                            "{}: {} connected (session {}, window {})",
                            self.context.persistence_id(),
                            connection.cookie(),
                            session_id,
                            window
                        );
                        self.promote_if_successor(&connection);
                    }
                    ConnectOutcome::Ignored => {}
                    ConnectOutcome::Rejected(cause) => self.drop_slot(&connection, cause),
                }
            }
            Err(err) => {
                warn!(
                    "{}: resolution of {} failed: {}",
                    self.context.persistence_id(),
                    connection.cookie(),
                    err
                );
                if let Some(next_attempt) = connection.resolution_failed(attempt) {
                    self.spawn_resolution(connection, next_attempt);
                }
            }
        }
    }

    /// Build a Connecting successor seeded with the silent connection's
    /// entries and start resolving it. The predecessor keeps forwarding
    /// until the successor is live. `cause` is the connection-wide fault
    /// behind the reconnect; it never reaches entry callbacks, the
    /// entries are replayed instead.
    fn start_reconnect(&self, predecessor: &Arc<Connection>, cause: ConnectionFailure) {
        let cookie = predecessor.cookie();
        let successor = {
            let mut connections = self.lock_connections();
            let Some(slot) = connections.get_mut(&cookie) else {
                return;
            };
            if !Arc::ptr_eq(&slot.active, predecessor) || slot.successor.is_some() {
                return;
            }
            let context = self.context.clone();
            let capacity = self.config.queue_capacity;
            let Some(successor) = predecessor.reconnect_with(|backlog, progress_baseline| {
                Connection::with_backlog(cookie, context, capacity, backlog, Some(progress_baseline))
            }) else {
                return;
            };
            slot.successor = Some(successor.clone());
            successor
        };
        info!(
            "{}: reconnecting {} through a successor connection ({})",
            self.context.persistence_id(),
            cookie,
            cause
        );
        self.spawn_resolution(successor, 0);
    }

    /// Flip the slot to a freshly connected successor, retiring the
    /// forwarding predecessor.
    fn promote_if_successor(&self, connection: &Arc<Connection>) {
        let mut connections = self.lock_connections();
        let Some(slot) = connections.get_mut(&connection.cookie()) else {
            return;
        };
        let is_successor = slot
            .successor
            .as_ref()
            .map_or(false, |successor| Arc::ptr_eq(successor, connection));
        if is_successor {
            slot.active = connection.clone();
            slot.successor = None;
            debug!(
                "{}: successor for {} is live, predecessor retired",
                self.context.persistence_id(),
                connection.cookie()
            );
        }
    }

    /// Remove a cookie's slot after a terminal failure, poisoning
    /// whichever half of the slot is still healthy.
    fn drop_slot(&self, connection: &Arc<Connection>, cause: ConnectionFailure) {
        let cookie = connection.cookie();
        let slot = {
            let mut connections = self.lock_connections();
            match connections.get(&cookie) {
                Some(slot) if slot.holds(connection) => connections.remove(&cookie),
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return;
        };
        warn!(
            "{}: dropping {} ({})",
            self.context.persistence_id(),
            cookie,
            cause
        );
        slot.active.poison(cause.clone());
        if let Some(successor) = slot.successor {
            successor.poison(cause);
        }
    }

    fn spawn_resolution(&self, connection: Arc<Connection>, attempt: u32) {
        if connection.is_poisoned() {
            return;
        }
        let backoff = self.config.backoff_for_attempt(attempt);
        let resolver = self.resolver.clone();
        let event_tx = self.context.event_sender();
        let cookie = connection.cookie();
        tokio::spawn(async move {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            let result = resolver.resolve(cookie).await;
            let _ = event_tx.send(ClientEvent::BackendResolved {
                connection,
                attempt,
                result,
            });
        });
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<CookieId, ConnectionSlot>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
