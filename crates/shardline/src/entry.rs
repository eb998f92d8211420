//! Queue entry records.
//!
//! A `ConnectionEntry` is an enqueued request plus its completion callback.
//! Completion consumes the entry, so "completed exactly once" holds by
//! construction. When the transmit queue hands an entry to the transport it
//! is decorated into a `TransmittedEntry` carrying the session id and
//! transmit sequence used for response correlation.

use shardwire::{ResponseEnvelope, ShardRequest};

use crate::error::RequestError;

/// Completion callback for one request. Invoked exactly once, with either
/// the matched response envelope or the failure that retired the entry.
pub type ResponseCallback = Box<dyn FnOnce(Result<ResponseEnvelope, RequestError>) + Send>;

/// An enqueued request awaiting transmission or completion.
pub struct ConnectionEntry {
    request: ShardRequest,
    callback: ResponseCallback,
    enqueued_ticks: u64,
}

impl ConnectionEntry {
    pub fn new(request: ShardRequest, callback: ResponseCallback, enqueued_ticks: u64) -> Self {
        Self {
            request,
            callback,
            enqueued_ticks,
        }
    }

    pub fn request(&self) -> &ShardRequest {
        &self.request
    }

    pub fn enqueued_ticks(&self) -> u64 {
        self.enqueued_ticks
    }

    /// Deliver the outcome to the callback, consuming the entry.
    pub fn complete(self, result: Result<ResponseEnvelope, RequestError>) {
        (self.callback)(result);
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("request", &self.request)
            .field("enqueued_ticks", &self.enqueued_ticks)
            .finish_non_exhaustive()
    }
}

/// A `ConnectionEntry` that has been handed to the transport.
///
/// Ordered by `tx_sequence` within a session; responses match against the
/// `(session_id, tx_sequence)` pair.
#[derive(Debug)]
pub struct TransmittedEntry {
    entry: ConnectionEntry,
    session_id: u64,
    tx_sequence: u64,
    transmitted_ticks: u64,
}

impl TransmittedEntry {
    pub fn new(entry: ConnectionEntry, session_id: u64, tx_sequence: u64, transmitted_ticks: u64) -> Self {
        Self {
            entry,
            session_id,
            tx_sequence,
            transmitted_ticks,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn tx_sequence(&self) -> u64 {
        self.tx_sequence
    }

    pub fn transmitted_ticks(&self) -> u64 {
        self.transmitted_ticks
    }

    pub fn enqueued_ticks(&self) -> u64 {
        self.entry.enqueued_ticks()
    }

    /// Strip the transmit decoration, e.g. for replay to a successor.
    pub fn into_entry(self) -> ConnectionEntry {
        self.entry
    }

    /// Deliver the outcome to the underlying entry's callback.
    pub fn complete(self, result: Result<ResponseEnvelope, RequestError>) {
        self.entry.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardwire::{CookieId, ResponseMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> ShardRequest {
        ShardRequest::new(CookieId(1), b"read /a".to_vec())
    }

    #[test]
    fn completion_invokes_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let entry = ConnectionEntry::new(
            request(),
            Box::new(move |result| {
                assert!(result.is_ok());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            42,
        );
        assert_eq!(entry.enqueued_ticks(), 42);

        entry.complete(Ok(ResponseEnvelope {
            session_id: 0,
            tx_sequence: 0,
            execution_time_ticks: 1,
            message: ResponseMessage::success(CookieId(1), b"ok".to_vec()),
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transmitted_entry_keeps_enqueue_ticks() {
        let entry = ConnectionEntry::new(request(), Box::new(|_| {}), 7);
        let tx = TransmittedEntry::new(entry, 3, 0, 100);
        assert_eq!(tx.enqueued_ticks(), 7);
        assert_eq!(tx.transmitted_ticks(), 100);
        assert_eq!(tx.session_id(), 3);

        let back = tx.into_entry();
        assert_eq!(back.enqueued_ticks(), 7);
    }
}
