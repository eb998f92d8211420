//! Per-backend connection state machine.
//!
//! One `Connection` exists per backend cookie. It owns the transmit queue,
//! enforces the tiered timer regime, and mediates the poisoning/reconnect
//! protocol:
//!
//! - **Connecting** - backend descriptor not yet resolved; the queue is
//!   Halted. Resolution failures and aliveness-tier hits restart
//!   resolution with backoff.
//! - **Connected** - queue is Transmitting on a live session. Backend
//!   silence past the aliveness window triggers reconnect through a
//!   successor connection.
//! - **Reconnecting** - drained; the queue forwards every enqueue to the
//!   successor, which absorbs the replayed entries. Retired once the
//!   successor connects.
//!
//! Producers may touch a connection from any thread; response envelopes
//! and timer callbacks arrive on the behavior's event loop. A single
//! mutex serializes all mutation, and entry callbacks always run outside
//! it.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use shardwire::{BackendInfo, CookieId, ResponseEnvelope, ShardRequest};

use crate::behavior::{ClientContext, ClientEvent};
use crate::entry::{ConnectionEntry, ResponseCallback};
use crate::error::{ConnectionFailure, PoisonedError, RequestError};
use crate::queue::{ReconnectForwarder, TransmitQueue};
use crate::transport::MessageTransport;

/// Maximum permitted backend silence while requests are outstanding.
/// Exceeding it forces a reconnect.
pub const BACKEND_ALIVE_TIMEOUT_NANOS: u64 = 30_000_000_000;

/// Maximum time a single request may sit from enqueue to completion.
pub const REQUEST_TIMEOUT_NANOS: u64 = 120_000_000_000;

/// Maximum time the queue may go without forward progress before the
/// connection is poisoned terminally.
pub const NO_PROGRESS_TIMEOUT_NANOS: u64 = 900_000_000_000;

/// Hard cap on the producer throttling sleep.
///
/// The throttle is zero while queue depth is at or below half the
/// backpressure limit, then ramps linearly to `MAX_DELAY_NANOS` at the
/// limit and saturates beyond it (see `queue::throttle_delay`).
pub const MAX_DELAY_NANOS: u64 = 5_000_000_000;

/// Throttling sleeps at or above this are logged.
pub const DEBUG_DELAY_NANOS: u64 = 100_000_000;

/// Outcome of one timeout check, consumed by the timer sweep.
enum CheckTimeout {
    /// Backend silent past the aliveness window
    TimedOut,
    /// Re-arm the timer this many ticks out
    ScheduleIn(u64),
    /// Queue empty, nothing to schedule
    Idle,
}

/// Result of applying a resolution result to a Connecting connection.
pub(crate) enum ConnectOutcome {
    /// Connected; the queue is transmitting
    Connected,
    /// The result was stale or the connection is already done
    Ignored,
    /// The backend is unusable; the connection poisoned itself
    Rejected(ConnectionFailure),
}

/// What the behavior should do after a timer sweep.
pub(crate) enum TimerVerdict {
    /// Nothing for the behavior; the sweep handled everything
    Continue,
    /// Backend silent while Connected; build a successor and replay
    Reconnect,
    /// Resolution is taking too long; retry it with backoff
    RetryResolve { attempt: u32 },
    /// The no-progress window elapsed; the connection poisoned itself
    Poisoned(ConnectionFailure),
}

enum ConnectionState {
    Connecting { attempt: u32 },
    Connected { backend: BackendInfo },
    Reconnecting,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StateKind {
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    fn kind(&self) -> StateKind {
        match self {
            Self::Connecting { .. } => StateKind::Connecting,
            Self::Connected { .. } => StateKind::Connected,
            Self::Reconnecting => StateKind::Reconnecting,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

struct InnerConnection {
    state: ConnectionState,
    queue: TransmitQueue,
    last_received_ticks: u64,
    have_timer: bool,
    poisoned: Option<ConnectionFailure>,
}

impl InnerConnection {
    fn bump_resolve_attempt(&mut self) -> u32 {
        if let ConnectionState::Connecting { attempt } = &mut self.state {
            *attempt += 1;
            *attempt
        } else {
            0
        }
    }
}

/// Logical connection to one backend shard.
pub struct Connection {
    cookie: CookieId,
    context: Arc<ClientContext>,
    self_ref: Weak<Connection>,
    /// Lock-free mirror of the poison cause so hot-path producers can
    /// bail out before taking the lock.
    poison_flag: OnceLock<ConnectionFailure>,
    inner: Mutex<InnerConnection>,
}

impl Connection {
    /// Fresh connection awaiting backend resolution.
    pub(crate) fn connecting(
        cookie: CookieId,
        context: Arc<ClientContext>,
        capacity: usize,
    ) -> Arc<Self> {
        Self::with_backlog(cookie, context, capacity, Vec::new(), None)
    }

    /// Reconnect successor seeded with replayed entries.
    ///
    /// `progress_baseline` carries the predecessor's stall baseline so the
    /// no-progress window accumulates across reconnects.
    pub(crate) fn with_backlog(
        cookie: CookieId,
        context: Arc<ClientContext>,
        capacity: usize,
        backlog: Vec<ConnectionEntry>,
        progress_baseline: Option<u64>,
    ) -> Arc<Self> {
        let now = context.now();
        let connection = Arc::new_cyclic(|weak: &Weak<Connection>| Connection {
            cookie,
            context: context.clone(),
            self_ref: weak.clone(),
            poison_flag: OnceLock::new(),
            inner: Mutex::new(InnerConnection {
                state: ConnectionState::Connecting { attempt: 0 },
                queue: TransmitQueue::halted_with_backlog(
                    capacity,
                    backlog,
                    progress_baseline.unwrap_or(now),
                ),
                last_received_ticks: now,
                have_timer: false,
                poisoned: None,
            }),
        });
        let mut inner = connection.lock_inner();
        if let Some(head) = inner.queue.oldest_enqueued_ticks() {
            let delay = (head + REQUEST_TIMEOUT_NANOS).saturating_sub(now);
            connection.arm_timer(&mut inner, delay);
        }
        drop(inner);
        connection
    }

    pub fn cookie(&self) -> CookieId {
        self.cookie
    }

    /// Diagnostic snapshot of the resolved backend, if Connected.
    pub fn backend_info(&self) -> Option<BackendInfo> {
        let inner = self.lock_inner();
        match &inner.state {
            ConnectionState::Connected { backend } => Some(backend.clone()),
            _ => None,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison_flag.get().is_some()
    }

    /// Enqueue a request and sleep out the backpressure delay.
    ///
    /// Safe to call from any task. The sleep happens after the lock is
    /// released; cancellation during the sleep cannot lose the entry, it
    /// is already committed to the queue.
    pub async fn send_request(
        &self,
        request: ShardRequest,
        callback: ResponseCallback,
    ) -> Result<(), PoisonedError> {
        let enqueued_ticks = self.context.now();
        let delay = self.enqueue_request(request, callback, enqueued_ticks)?;
        let delay = delay.min(MAX_DELAY_NANOS);
        if delay >= DEBUG_DELAY_NANOS {
            debug!(
                "{}: backpressure on {}, sleeping {}ms",
                self.context.persistence_id(),
                self.cookie,
                delay / 1_000_000
            );
        }
        if delay > 0 {
            tokio::time::sleep(Duration::from_nanos(delay)).await;
        }
        Ok(())
    }

    /// Enqueue without sleeping; the caller owns its pressure policy.
    /// Returns the throttle delay in ticks.
    pub fn enqueue_request(
        &self,
        request: ShardRequest,
        callback: ResponseCallback,
        enqueued_ticks: u64,
    ) -> Result<u64, PoisonedError> {
        self.enqueue_entry(ConnectionEntry::new(request, callback, enqueued_ticks))
            .map_err(|(_, err)| err)
    }

    /// Entry-level enqueue shared with the reconnect forwarder. On a
    /// poisoned connection the entry is handed back so committed entries
    /// can still be failed through their callback.
    pub(crate) fn enqueue_entry(
        &self,
        entry: ConnectionEntry,
    ) -> Result<u64, (ConnectionEntry, PoisonedError)> {
        if let Some(cause) = self.poison_flag.get() {
            return Err((entry, self.poisoned_error(cause.clone())));
        }
        let mut inner = self.lock_inner();
        if let Some(cause) = inner.poisoned.clone() {
            return Err((entry, self.poisoned_error(cause)));
        }
        let now = self.context.now();
        if inner.queue.is_empty() && !inner.queue.has_successor() && !inner.have_timer {
            let delay = (entry.enqueued_ticks() + REQUEST_TIMEOUT_NANOS).saturating_sub(now);
            self.arm_timer(&mut inner, delay);
        }
        Ok(inner.queue.enqueue(entry, now))
    }

    /// Deliver a response envelope from the backend.
    ///
    /// Bumps the aliveness clock, matches against the in-flight run, and
    /// completes the matched entry outside the lock. Unmatched envelopes
    /// (unknown sequence, stale session) are logged and dropped.
    pub fn receive_response(&self, envelope: ResponseEnvelope) {
        let matched = {
            let mut inner = self.lock_inner();
            let now = self.context.now();
            inner.last_received_ticks = now;
            let matched = inner.queue.complete(&envelope, now);
            if matched.is_some() && !inner.have_timer {
                if let Some(head) = inner.queue.oldest_enqueued_ticks() {
                    let delay = (head + REQUEST_TIMEOUT_NANOS).saturating_sub(now);
                    self.arm_timer(&mut inner, delay);
                }
            }
            matched
        };
        match matched {
            Some(entry) => {
                trace!(
                    "{}: response for {} sequence {} after {} ticks in flight",
                    self.context.persistence_id(),
                    self.cookie,
                    entry.tx_sequence(),
                    envelope.execution_time_ticks
                );
                entry.complete(Ok(envelope));
            }
            None => debug!(
                "{}: dropping unmatched response on {} (session {}, sequence {})",
                self.context.persistence_id(),
                self.cookie,
                envelope.session_id,
                envelope.tx_sequence
            ),
        }
    }

    /// Terminally fail this connection, failing every queued entry with
    /// the cause. Idempotent.
    pub fn poison(&self, cause: ConnectionFailure) {
        let entries = {
            let mut inner = self.lock_inner();
            if inner.poisoned.is_some() {
                return;
            }
            self.poison_locked(&mut inner, cause.clone())
        };
        warn!(
            "{}: {} poisoned ({}), failing {} queued requests",
            self.context.persistence_id(),
            self.cookie,
            cause,
            entries.len()
        );
        for entry in entries {
            entry.complete(Err(RequestError::ConnectionFailed(cause.clone())));
        }
    }

    /// Timer sweep. Runs on the behavior's event loop.
    pub(crate) fn run_timer(&self) -> TimerVerdict {
        let now = self.context.now();
        let mut inner = self.lock_inner();
        inner.have_timer = false;
        if inner.poisoned.is_some() {
            return TimerVerdict::Continue;
        }

        let stalling = inner.queue.ticks_stalling(now);
        if stalling >= NO_PROGRESS_TIMEOUT_NANOS {
            let cause = ConnectionFailure::NoProgress {
                stalled_seconds: stalling as f64 * 1e-9,
            };
            let entries = self.poison_locked(&mut inner, cause.clone());
            drop(inner);
            warn!(
                "{}: {} made no progress, failing {} queued requests",
                self.context.persistence_id(),
                self.cookie,
                entries.len()
            );
            for entry in entries {
                entry.complete(Err(RequestError::ConnectionFailed(cause.clone())));
            }
            return TimerVerdict::Poisoned(cause);
        }

        match Self::check_timeout(&mut inner, now) {
            (CheckTimeout::TimedOut, _) => match inner.state.kind() {
                StateKind::Connected => {
                    let silent = now.saturating_sub(inner.last_received_ticks);
                    drop(inner);
                    info!(
                        "{}: backend {} silent for {}ms, reconnecting",
                        self.context.persistence_id(),
                        self.cookie,
                        silent / 1_000_000
                    );
                    TimerVerdict::Reconnect
                }
                StateKind::Connecting => {
                    let attempt = inner.bump_resolve_attempt();
                    // Restart the aliveness window for the next attempt.
                    // No entry sweep here: while the backend is silent the
                    // aliveness tier preempts per-request timeouts, and
                    // queued entries live on for replay.
                    inner.last_received_ticks = now;
                    self.arm_timer(&mut inner, BACKEND_ALIVE_TIMEOUT_NANOS);
                    drop(inner);
                    debug!(
                        "{}: resolution of {} is slow, retrying (attempt {})",
                        self.context.persistence_id(),
                        self.cookie,
                        attempt
                    );
                    TimerVerdict::RetryResolve { attempt }
                }
                StateKind::Reconnecting => TimerVerdict::Continue,
            },
            (CheckTimeout::ScheduleIn(delay), expired) => {
                self.arm_timer(&mut inner, delay);
                drop(inner);
                self.fail_expired(expired);
                TimerVerdict::Continue
            }
            (CheckTimeout::Idle, expired) => {
                drop(inner);
                self.fail_expired(expired);
                TimerVerdict::Continue
            }
        }
    }

    /// Flip from Connecting to Connected on a resolved backend.
    ///
    /// `attempt` is the resolution attempt the result belongs to; a stale
    /// result (superseded by a later restart) is ignored. A backend
    /// speaking an ABI outside the supported range is rejected before any
    /// envelope is built for it, and the connection poisons itself.
    pub(crate) fn complete_connect(
        &self,
        attempt: u32,
        session_id: u64,
        backend: BackendInfo,
        transport: Arc<dyn MessageTransport>,
    ) -> ConnectOutcome {
        let now = self.context.now();
        let mut inner = self.lock_inner();
        if inner.poisoned.is_some() {
            return ConnectOutcome::Ignored;
        }
        match &inner.state {
            ConnectionState::Connecting { attempt: current } if *current == attempt => {}
            _ => return ConnectOutcome::Ignored,
        }
        if !backend.abi_version.is_supported() {
            let cause = ConnectionFailure::UnsupportedAbi {
                version: backend.abi_version,
            };
            let entries = self.poison_locked(&mut inner, cause.clone());
            drop(inner);
            warn!(
                "{}: {} resolved to {} speaking unsupported ABI {}, failing {} queued requests",
                self.context.persistence_id(),
                self.cookie,
                backend.endpoint,
                backend.abi_version,
                entries.len()
            );
            for entry in entries {
                entry.complete(Err(RequestError::ConnectionFailed(cause.clone())));
            }
            return ConnectOutcome::Rejected(cause);
        }
        inner.queue.become_transmitting(session_id, &backend, transport, now);
        // Aliveness starts fresh after connect, including after a
        // possibly lengthy replay into this connection.
        inner.last_received_ticks = now;
        inner.state = ConnectionState::Connected { backend };
        if !inner.have_timer {
            if let Some(head) = inner.queue.oldest_enqueued_ticks() {
                let delay = (head + REQUEST_TIMEOUT_NANOS).saturating_sub(now);
                self.arm_timer(&mut inner, delay);
            }
        }
        ConnectOutcome::Connected
    }

    /// Note a failed resolution attempt. Returns the next attempt number,
    /// or None when the failure is stale or the connection is done.
    pub(crate) fn resolution_failed(&self, attempt: u32) -> Option<u32> {
        let mut inner = self.lock_inner();
        if inner.poisoned.is_some() {
            return None;
        }
        match &inner.state {
            ConnectionState::Connecting { attempt: current } if *current == attempt => {}
            _ => return None,
        }
        let next = inner.bump_resolve_attempt();
        inner.last_received_ticks = self.context.now();
        Some(next)
    }

    /// Drain this Connected connection into a successor built by
    /// `make_successor`, then start forwarding to it.
    ///
    /// The successor is constructed under this connection's lock so no
    /// enqueue can race into the drained queue between drain and
    /// forwarder install. Returns None when the connection is not in a
    /// reconnectable state.
    pub(crate) fn reconnect_with<F>(&self, make_successor: F) -> Option<Arc<Connection>>
    where
        F: FnOnce(Vec<ConnectionEntry>, u64) -> Arc<Connection>,
    {
        let now = self.context.now();
        let mut inner = self.lock_inner();
        if inner.poisoned.is_some() || inner.state.kind() != StateKind::Connected {
            return None;
        }
        let baseline = inner.queue.progress_baseline();
        let entries = inner.queue.drain();
        debug!(
            "{}: replaying {} entries from {} to successor",
            self.context.persistence_id(),
            entries.len(),
            self.cookie
        );
        let successor = make_successor(entries, baseline);
        inner
            .queue
            .finish_replay(ReconnectForwarder::new(Arc::downgrade(&successor)));
        inner.state = ConnectionState::Reconnecting;
        inner.last_received_ticks = now;
        Some(successor)
    }

    fn poisoned_error(&self, cause: ConnectionFailure) -> PoisonedError {
        PoisonedError {
            cookie: self.cookie,
            cause,
        }
    }

    fn poison_locked(
        &self,
        inner: &mut InnerConnection,
        cause: ConnectionFailure,
    ) -> Vec<ConnectionEntry> {
        inner.poisoned = Some(cause.clone());
        let _ = self.poison_flag.set(cause);
        inner.queue.drain()
    }

    /// Per-request timeout check.
    ///
    /// Empty queue: Idle. Backend silent past the aliveness window:
    /// TimedOut. Otherwise sweep expired entries off the head and return
    /// the remaining head's deadline as ScheduleIn; expired entries are
    /// returned with their open time for completion outside the lock.
    fn check_timeout(
        inner: &mut InnerConnection,
        now: u64,
    ) -> (CheckTimeout, Vec<(ConnectionEntry, u64)>) {
        if inner.queue.is_empty() {
            return (CheckTimeout::Idle, Vec::new());
        }
        if now.saturating_sub(inner.last_received_ticks) >= BACKEND_ALIVE_TIMEOUT_NANOS {
            return (CheckTimeout::TimedOut, Vec::new());
        }
        let mut expired = Vec::new();
        let mut outcome = CheckTimeout::Idle;
        while let Some(head_ticks) = inner.queue.oldest_enqueued_ticks() {
            let been_open = now.saturating_sub(head_ticks);
            if been_open >= REQUEST_TIMEOUT_NANOS {
                if let Some(entry) = inner.queue.remove_oldest() {
                    expired.push((entry, been_open));
                }
            } else {
                outcome = CheckTimeout::ScheduleIn(REQUEST_TIMEOUT_NANOS - been_open);
                break;
            }
        }
        if !expired.is_empty() {
            inner.queue.refill(now);
        }
        (outcome, expired)
    }

    fn fail_expired(&self, expired: Vec<(ConnectionEntry, u64)>) {
        for (entry, been_open) in expired {
            let elapsed_seconds = been_open as f64 * 1e-9;
            warn!(
                "{}: request to {} timed out after {:.1}s",
                self.context.persistence_id(),
                self.cookie,
                elapsed_seconds
            );
            entry.complete(Err(RequestError::Timeout { elapsed_seconds }));
        }
    }

    /// Arm the connection timer. A rescheduling delay is clamped into
    /// `[0, BACKEND_ALIVE_TIMEOUT_NANOS]` so the aliveness check always
    /// runs frequently enough.
    fn arm_timer(&self, inner: &mut InnerConnection, delay_ticks: u64) {
        let delay = delay_ticks.min(BACKEND_ALIVE_TIMEOUT_NANOS);
        if let Some(this) = self.self_ref.upgrade() {
            inner.have_timer = true;
            self.context
                .execute_in_actor(delay, ClientEvent::RunTimer(this));
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, InnerConnection> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn have_timer(&self) -> bool {
        self.lock_inner().have_timer
    }

    #[cfg(test)]
    pub(crate) fn state_name(&self) -> &'static str {
        self.lock_inner().state.name()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("Connection")
            .field("cookie", &self.cookie)
            .field("state", &inner.state.name())
            .field("have_timer", &inner.have_timer)
            .field("poisoned", &inner.poisoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::test_support::{drain_events, test_context};
    use shardwire::{AbiVersion, RequestEnvelope, ResponseMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const COOKIE: CookieId = CookieId(1);

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<RequestEnvelope>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<RequestEnvelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MessageTransport for RecordingTransport {
        fn send_envelope(&self, _endpoint: &str, envelope: RequestEnvelope) {
            self.sent.lock().unwrap().push(envelope);
        }
    }

    fn backend(max_messages: usize) -> BackendInfo {
        BackendInfo::new("actor://member-1/shard-1", "shard-1", AbiVersion::V2, max_messages)
    }

    fn request(n: u64) -> ShardRequest {
        ShardRequest::new(COOKIE, format!("req-{n}").into_bytes())
    }

    fn sink() -> (ResponseCallback, Arc<StdMutex<Vec<Result<ResponseEnvelope, RequestError>>>>) {
        let results = Arc::new(StdMutex::new(Vec::new()));
        let seen = results.clone();
        (
            Box::new(move |result| seen.lock().unwrap().push(result)),
            results,
        )
    }

    fn success(session_id: u64, tx_sequence: u64) -> ResponseEnvelope {
        ResponseEnvelope {
            session_id,
            tx_sequence,
            execution_time_ticks: 5,
            message: ResponseMessage::success(COOKIE, b"ok".to_vec()),
        }
    }

    fn connected(outcome: ConnectOutcome) -> bool {
        matches!(outcome, ConnectOutcome::Connected)
    }

    #[tokio::test]
    async fn poisoned_enqueue_fails_fast_citing_cause() {
        let (context, _rx, _ticker) = test_context();
        let connection = Connection::connecting(COOKIE, context, 10);
        connection.poison(ConnectionFailure::Shutdown);
        connection.poison(ConnectionFailure::BackendTimeout); // idempotent

        let (callback, _) = sink();
        let err = connection
            .enqueue_request(request(1), callback, 0)
            .unwrap_err();
        assert_eq!(err.cookie, COOKIE);
        assert_eq!(err.cause, ConnectionFailure::Shutdown);
        assert!(connection.is_poisoned());
    }

    #[tokio::test]
    async fn poison_fails_every_queued_entry_exactly_once() {
        let (context, _rx, _ticker) = test_context();
        let connection = Connection::connecting(COOKIE, context, 10);
        let calls = Arc::new(AtomicUsize::new(0));
        for n in 0..3 {
            let seen = calls.clone();
            connection
                .enqueue_request(
                    request(n),
                    Box::new(move |result| {
                        assert!(matches!(
                            result,
                            Err(RequestError::ConnectionFailed(ConnectionFailure::Shutdown))
                        ));
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
                    0,
                )
                .unwrap();
        }
        connection.poison(ConnectionFailure::Shutdown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn request_timeout_is_inclusive_and_reports_seconds() {
        let (context, _rx, ticker) = test_context();
        let transport = Arc::new(RecordingTransport::default());
        let connection = Connection::connecting(COOKIE, context, 10);
        assert!(connected(connection.complete_connect(0, 0, backend(4), transport)));

        let (callback, results) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        // Keep the backend alive with an unmatched envelope, then land
        // exactly on the per-request deadline.
        ticker.set(REQUEST_TIMEOUT_NANOS - 1_000_000_000);
        connection.receive_response(success(0, 99));
        ticker.set(REQUEST_TIMEOUT_NANOS);
        assert!(matches!(connection.run_timer(), TimerVerdict::Continue));

        let results = results.lock().unwrap();
        match results.as_slice() {
            [Err(RequestError::Timeout { elapsed_seconds })] => {
                assert!((elapsed_seconds - 120.0).abs() < 1e-6);
            }
            other => panic!("unexpected results: {other:?}"),
        }
        // Queue drained entirely, so the timer stays disarmed.
        assert!(!connection.have_timer());
    }

    #[tokio::test]
    async fn backend_silence_at_threshold_requests_reconnect() {
        let (context, _rx, ticker) = test_context();
        let transport = Arc::new(RecordingTransport::default());
        let connection = Connection::connecting(COOKIE, context, 10);
        assert!(connected(connection.complete_connect(0, 0, backend(4), transport)));

        let (callback, _) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        ticker.set(BACKEND_ALIVE_TIMEOUT_NANOS);
        assert!(matches!(connection.run_timer(), TimerVerdict::Reconnect));
    }

    #[tokio::test]
    async fn no_progress_poisons_terminally() {
        let (context, _rx, ticker) = test_context();
        let connection = Connection::connecting(COOKIE, context, 10);
        let (callback, results) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        ticker.set(NO_PROGRESS_TIMEOUT_NANOS);
        match connection.run_timer() {
            TimerVerdict::Poisoned(ConnectionFailure::NoProgress { stalled_seconds }) => {
                assert!((stalled_seconds - 900.0).abs() < 1e-6);
            }
            _ => panic!("expected no-progress poisoning"),
        }
        assert!(matches!(
            results.lock().unwrap().as_slice(),
            [Err(RequestError::ConnectionFailed(
                ConnectionFailure::NoProgress { .. }
            ))]
        ));

        let (callback, _) = sink();
        assert!(connection
            .enqueue_request(request(2), callback, 0)
            .is_err());
    }

    #[tokio::test]
    async fn unsupported_abi_is_rejected_before_any_transmit() {
        let (context, _rx, _ticker) = test_context();
        let transport = Arc::new(RecordingTransport::default());
        let connection = Connection::connecting(COOKIE, context, 10);
        let (callback, results) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        let stale_backend =
            BackendInfo::new("actor://member-1/shard-1", "shard-1", AbiVersion::V1, 4);
        let outcome = connection.complete_connect(0, 0, stale_backend, transport.clone());
        assert!(matches!(
            outcome,
            ConnectOutcome::Rejected(ConnectionFailure::UnsupportedAbi {
                version: AbiVersion::V1
            })
        ));

        // Nothing was handed to the transport, and the queued entry was
        // failed with the rejection cause.
        assert!(transport.sent().is_empty());
        assert!(connection.is_poisoned());
        assert!(matches!(
            results.lock().unwrap().as_slice(),
            [Err(RequestError::ConnectionFailed(
                ConnectionFailure::UnsupportedAbi { .. }
            ))]
        ));

        let err = connection
            .enqueue_request(request(2), Box::new(|_| {}), 0)
            .unwrap_err();
        assert!(matches!(err.cause, ConnectionFailure::UnsupportedAbi { .. }));
    }

    #[tokio::test]
    async fn slow_resolution_retries_with_fresh_attempt() {
        let (context, _rx, ticker) = test_context();
        let connection = Connection::connecting(COOKIE, context, 10);
        let (callback, _) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        ticker.set(BACKEND_ALIVE_TIMEOUT_NANOS);
        match connection.run_timer() {
            TimerVerdict::RetryResolve { attempt } => assert_eq!(attempt, 1),
            _ => panic!("expected resolution retry"),
        }
        // The aliveness window restarted; a stale result for attempt 0 is
        // refused, the current attempt connects.
        let transport = Arc::new(RecordingTransport::default());
        assert!(!connected(connection.complete_connect(0, 0, backend(4), transport.clone())));
        assert!(connected(connection.complete_connect(1, 0, backend(4), transport)));
        assert_eq!(connection.state_name(), "connected");
    }

    #[tokio::test]
    async fn reconnect_replays_in_order_and_forwards_new_enqueues() {
        let (context, rx, ticker) = test_context();
        let transport = Arc::new(RecordingTransport::default());
        let connection = Connection::connecting(COOKIE, context.clone(), 10);
        assert!(connected(connection.complete_connect(0, 0, backend(2), transport.clone())));

        for n in 0..3 {
            let (callback, _) = sink();
            connection.enqueue_request(request(n), callback, n).unwrap();
        }
        assert_eq!(transport.sent().len(), 2);

        ticker.set(BACKEND_ALIVE_TIMEOUT_NANOS);
        let successor = connection
            .reconnect_with(|backlog, baseline| {
                assert_eq!(backlog.len(), 3);
                assert_eq!(baseline, 0);
                Connection::with_backlog(COOKIE, context.clone(), 10, backlog, Some(baseline))
            })
            .expect("reconnectable");
        assert_eq!(connection.state_name(), "reconnecting");

        // Successor resolves on a fresh session; the backlog is replayed
        // in original enqueue order with reassigned sequences.
        let successor_transport = Arc::new(RecordingTransport::default());
        assert!(connected(successor.complete_connect(0, 1, backend(2), successor_transport.clone())));
        let replayed = successor_transport.sent();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].session_id, 1);
        assert_eq!(replayed[0].tx_sequence, 0);
        assert_eq!(replayed[0].message, request(0));
        assert_eq!(replayed[1].message, request(1));

        // New enqueues on the predecessor land on the successor.
        let (callback, _) = sink();
        connection.enqueue_request(request(9), callback, 0).unwrap();
        let responses = [success(1, 0), success(1, 1), success(1, 2)];
        for envelope in responses {
            successor.receive_response(envelope);
        }
        let sent = successor_transport.sent();
        assert_eq!(sent.last().map(|env| env.message.clone()), Some(request(9)));

        drain_events(rx);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_delay_is_clamped_to_aliveness_window() {
        let (context, mut rx, _ticker) = test_context();
        let connection = Connection::connecting(COOKIE, context, 10);
        let (callback, _) = sink();
        // Head deadline is a full request timeout away, but the armed
        // timer must fire within the aliveness window.
        let start = tokio::time::Instant::now();
        connection.enqueue_request(request(1), callback, 0).unwrap();
        assert!(connection.have_timer());

        let event = rx.recv().await.expect("timer event");
        assert!(matches!(event, ClientEvent::RunTimer(_)));
        assert_eq!(
            start.elapsed(),
            Duration::from_nanos(BACKEND_ALIVE_TIMEOUT_NANOS)
        );
    }

    #[tokio::test]
    async fn unmatched_response_updates_liveness_only() {
        let (context, _rx, ticker) = test_context();
        let transport = Arc::new(RecordingTransport::default());
        let connection = Connection::connecting(COOKIE, context, 10);
        assert!(connected(connection.complete_connect(0, 0, backend(2), transport.clone())));
        let (callback, results) = sink();
        connection.enqueue_request(request(1), callback, 0).unwrap();

        ticker.set(BACKEND_ALIVE_TIMEOUT_NANOS - 1);
        connection.receive_response(success(0, 42));
        assert!(results.lock().unwrap().is_empty());

        // Liveness was refreshed, so the aliveness tier does not fire.
        ticker.set(BACKEND_ALIVE_TIMEOUT_NANOS);
        assert!(matches!(connection.run_timer(), TimerVerdict::Continue));
    }
}
