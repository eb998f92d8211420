//! Typed errors for the connection core.
//!
//! Per-entry failures travel only through entry callbacks; connection-wide
//! faults flow through the state machine and reach callers via their
//! pending callbacks. The one synchronous error a producer can see is
//! `PoisonedError`, from enqueueing on a terminally failed connection.

use thiserror::Error;

use shardwire::{AbiVersion, CookieId};

/// Connection-wide fault. Once a connection is poisoned with one of these,
/// it is terminal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionFailure {
    /// Backend went silent past the aliveness window. Drives reconnect;
    /// never delivered to an entry callback (entries are replayed).
    #[error("backend connection timed out")]
    BackendTimeout,

    /// The queue made no forward progress for the terminal window.
    #[error("no progress in {stalled_seconds:.1} seconds")]
    NoProgress { stalled_seconds: f64 },

    /// The cookie resolved to a backend speaking an ABI this client
    /// cannot build envelopes for.
    #[error("backend speaks unsupported ABI {version}")]
    UnsupportedAbi { version: AbiVersion },

    /// Client is shutting down.
    #[error("client shutting down")]
    Shutdown,
}

/// Failure delivered to a single entry's callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The request sat unanswered past the per-request window.
    #[error("request timed out after {elapsed_seconds:.1} seconds")]
    Timeout { elapsed_seconds: f64 },

    /// The owning connection failed as a whole.
    #[error("backend connection failed")]
    ConnectionFailed(#[source] ConnectionFailure),
}

/// Synchronous illegal-state failure from enqueueing on a poisoned
/// connection. Carries the original poison cause.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("connection to {cookie} is poisoned")]
pub struct PoisonedError {
    pub cookie: CookieId,
    #[source]
    pub cause: ConnectionFailure,
}

/// Failure from the backend directory layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolverError {
    #[error("no backend known for {0}")]
    UnknownCookie(CookieId),

    #[error("backend directory unavailable: {message}")]
    Unavailable { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn poisoned_error_cites_cause() {
        let err = PoisonedError {
            cookie: CookieId(3),
            cause: ConnectionFailure::NoProgress {
                stalled_seconds: 900.0,
            },
        };
        assert_eq!(err.to_string(), "connection to shard-3 is poisoned");
        let cause = err.source().expect("cause chain");
        assert!(cause.to_string().contains("900.0 seconds"));
    }

    #[test]
    fn timeout_reports_seconds() {
        let err = RequestError::Timeout {
            elapsed_seconds: 120.0,
        };
        assert_eq!(err.to_string(), "request timed out after 120.0 seconds");
    }
}
