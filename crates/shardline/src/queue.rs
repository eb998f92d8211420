//! Transmit queue for one backend connection.
//!
//! The queue holds entries in two ordered runs: pending (not yet handed to
//! the transport) and in-flight (transmitted, awaiting a response). It has
//! three operating variants:
//!
//! - **Halted** - accepts enqueues, transmits nothing. Used while the
//!   backend descriptor is unknown.
//! - **Transmitting** - keeps the in-flight run filled up to the
//!   backpressure window and stamps each envelope with the session id and
//!   the next transmit sequence.
//! - **Forwarding** - hands every enqueue straight to a reconnect
//!   successor; the local runs are empty by construction once the
//!   forwarder is installed.
//!
//! Enqueue returns a throttle delay that producers sleep for; the formula
//! lives next to the constant block in `connection.rs`.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use shardwire::{BackendInfo, RequestEnvelope, ResponseEnvelope};

use crate::connection::{Connection, MAX_DELAY_NANOS};
use crate::entry::{ConnectionEntry, TransmittedEntry};
use crate::error::RequestError;
use crate::transport::MessageTransport;

/// Weak handle to a reconnect successor. Weak so a retired predecessor can
/// never keep its replacement alive through a forgotten forwarder.
pub(crate) struct ReconnectForwarder {
    successor: Weak<Connection>,
}

impl ReconnectForwarder {
    pub(crate) fn new(successor: Weak<Connection>) -> Self {
        Self { successor }
    }

    /// Forward an already-committed entry to the successor, returning the
    /// successor's throttle delay. The entry keeps its original enqueue
    /// tick so the per-request window keeps measuring from first enqueue.
    fn forward(&self, entry: ConnectionEntry) -> u64 {
        match self.successor.upgrade() {
            Some(successor) => match successor.enqueue_entry(entry) {
                Ok(delay) => delay,
                Err((entry, err)) => {
                    entry.complete(Err(RequestError::ConnectionFailed(err.cause)));
                    0
                }
            },
            // Successor torn down; the entry was committed, so it must
            // still complete exactly once.
            None => {
                entry.complete(Err(RequestError::ConnectionFailed(
                    crate::error::ConnectionFailure::Shutdown,
                )));
                0
            }
        }
    }
}

/// Transmission state while a backend session is live.
struct TxState {
    endpoint: String,
    session_id: u64,
    next_tx_sequence: u64,
    window: usize,
    transport: Arc<dyn MessageTransport>,
}

enum QueueVariant {
    Halted,
    Transmitting(TxState),
    Forwarding(ReconnectForwarder),
}

pub(crate) struct TransmitQueue {
    capacity: usize,
    pending: VecDeque<ConnectionEntry>,
    inflight: VecDeque<TransmittedEntry>,
    /// Tick of the last forward progress (completion), or of the
    /// empty-to-non-empty transition that started the current busy spell.
    last_progress_ticks: u64,
    variant: QueueVariant,
}

impl TransmitQueue {
    pub(crate) fn halted(capacity: usize, now: u64) -> Self {
        Self::halted_with_backlog(capacity, Vec::new(), now)
    }

    /// Halted queue seeded with replayed entries. `progress_baseline` is
    /// the predecessor's stall baseline, so the no-progress window keeps
    /// accumulating across reconnects.
    pub(crate) fn halted_with_backlog(
        capacity: usize,
        backlog: Vec<ConnectionEntry>,
        progress_baseline: u64,
    ) -> Self {
        Self {
            capacity,
            pending: backlog.into(),
            inflight: VecDeque::new(),
            last_progress_ticks: progress_baseline,
            variant: QueueVariant::Halted,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_empty()
    }

    fn depth(&self) -> usize {
        self.pending.len() + self.inflight.len()
    }

    pub(crate) fn has_successor(&self) -> bool {
        matches!(self.variant, QueueVariant::Forwarding(_))
    }

    /// Backpressure limit throttling is computed against. Before the
    /// backend window is known, the client-side capacity bounds depth.
    fn limit(&self) -> usize {
        match &self.variant {
            QueueVariant::Transmitting(tx) => tx.window,
            _ => self.capacity,
        }
    }

    /// Append an entry (or forward it to the successor) and return the
    /// throttle delay the producer should sleep for.
    pub(crate) fn enqueue(&mut self, entry: ConnectionEntry, now: u64) -> u64 {
        if let QueueVariant::Forwarding(forwarder) = &self.variant {
            return forwarder.forward(entry);
        }
        if self.is_empty() {
            // Stall clock starts when work arrives, not at queue creation.
            self.last_progress_ticks = now;
        }
        self.pending.push_back(entry);
        self.try_transmit(now);
        throttle_delay(self.depth(), self.limit())
    }

    /// Fill the in-flight run from pending up to the window.
    fn try_transmit(&mut self, now: u64) {
        let QueueVariant::Transmitting(tx) = &mut self.variant else {
            return;
        };
        while self.inflight.len() < tx.window {
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            let tx_sequence = tx.next_tx_sequence;
            tx.next_tx_sequence += 1;
            let envelope = RequestEnvelope {
                session_id: tx.session_id,
                tx_sequence,
                message: entry.request().clone(),
            };
            tx.transport.send_envelope(&tx.endpoint, envelope);
            self.inflight
                .push_back(TransmittedEntry::new(entry, tx.session_id, tx_sequence, now));
        }
    }

    /// Refill the window after the timeout sweeper removed entries.
    pub(crate) fn refill(&mut self, now: u64) {
        self.try_transmit(now);
    }

    /// Match a response envelope against the in-flight run.
    ///
    /// In-order replies hit the head at position 0; out-of-order replies
    /// scan. No match (unknown sequence or stale session) leaves the
    /// queue untouched.
    pub(crate) fn complete(&mut self, envelope: &ResponseEnvelope, now: u64) -> Option<TransmittedEntry> {
        let idx = self.inflight.iter().position(|t| {
            t.session_id() == envelope.session_id && t.tx_sequence() == envelope.tx_sequence
        })?;
        let entry = self.inflight.remove(idx)?;
        self.last_progress_ticks = now;
        self.try_transmit(now);
        Some(entry)
    }

    /// Ticks since the queue last made forward progress. An empty queue
    /// never stalls.
    pub(crate) fn ticks_stalling(&self, now: u64) -> u64 {
        if self.is_empty() {
            0
        } else {
            now.saturating_sub(self.last_progress_ticks)
        }
    }

    pub(crate) fn progress_baseline(&self) -> u64 {
        self.last_progress_ticks
    }

    /// Enqueue tick of the oldest entry. In-flight entries were enqueued
    /// before anything still pending, so the in-flight head is oldest.
    pub(crate) fn oldest_enqueued_ticks(&self) -> Option<u64> {
        self.inflight
            .front()
            .map(TransmittedEntry::enqueued_ticks)
            .or_else(|| self.pending.front().map(ConnectionEntry::enqueued_ticks))
    }

    /// Remove and return the oldest entry, for the timeout sweeper.
    pub(crate) fn remove_oldest(&mut self) -> Option<ConnectionEntry> {
        self.inflight
            .pop_front()
            .map(TransmittedEntry::into_entry)
            .or_else(|| self.pending.pop_front())
    }

    /// Drain every entry, in original enqueue order, for replay to a
    /// successor or for poisoning.
    pub(crate) fn drain(&mut self) -> Vec<ConnectionEntry> {
        let mut entries = Vec::with_capacity(self.depth());
        entries.extend(self.inflight.drain(..).map(TransmittedEntry::into_entry));
        entries.extend(self.pending.drain(..));
        entries
    }

    /// Install the reconnect forwarder. The queue must already be drained.
    pub(crate) fn finish_replay(&mut self, forwarder: ReconnectForwarder) {
        debug_assert!(self.is_empty(), "forwarder installed over live entries");
        self.variant = QueueVariant::Forwarding(forwarder);
    }

    /// Flip from Halted to Transmitting with the resolved backend window
    /// and dispatch any backlog.
    pub(crate) fn become_transmitting(
        &mut self,
        session_id: u64,
        backend: &BackendInfo,
        transport: Arc<dyn MessageTransport>,
        now: u64,
    ) {
        let window = self.capacity.min(backend.max_messages).max(1);
        self.variant = QueueVariant::Transmitting(TxState {
            endpoint: backend.endpoint.clone(),
            session_id,
            next_tx_sequence: 0,
            window,
            transport,
        });
        self.try_transmit(now);
    }
}

/// Throttle delay for a queue at `depth` entries against `limit`.
///
/// Zero while depth is at or below half the limit, then a linear ramp that
/// reaches `MAX_DELAY_NANOS` when depth hits the limit, saturating beyond.
fn throttle_delay(depth: usize, limit: usize) -> u64 {
    let threshold = limit / 2;
    if limit == 0 || depth <= threshold {
        return 0;
    }
    let span = (limit - threshold) as u128;
    let over = (depth - threshold).min(limit - threshold) as u128;
    ((MAX_DELAY_NANOS as u128 * over) / span) as u64
}
