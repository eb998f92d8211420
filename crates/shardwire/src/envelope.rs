//! Request and response envelopes.
//!
//! Envelopes are the on-wire shells around messages. A request envelope is
//! stamped by the transmit queue with the session id and the per-session
//! transmit sequence at the moment it is handed to the transport; the
//! backend echoes both in its response envelope, which is all the client
//! needs for correlation - no body deserialization on the matching path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::CookieId;
use crate::request::ShardRequest;

/// On-wire shell for a request handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Session scope for the transmit sequence
    pub session_id: u64,
    /// Position in the session's transmit order
    pub tx_sequence: u64,
    /// The request being carried
    pub message: ShardRequest,
}

/// On-wire shell for a backend response.
///
/// Failure responses use the same shell with a failure message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Session the response belongs to
    pub session_id: u64,
    /// Transmit sequence of the request being answered
    pub tx_sequence: u64,
    /// Ticks the backend spent executing the request
    pub execution_time_ticks: u64,
    /// Success or failure body
    pub message: ResponseMessage,
}

impl ResponseEnvelope {
    /// Routing cookie extracted from the message body.
    pub fn target(&self) -> CookieId {
        self.message.target()
    }
}

/// Response message body - success or a typed shard fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseMessage {
    /// Request executed; payload is the serialized result
    Success {
        target: CookieId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Request rejected or failed on the backend
    Failure { target: CookieId, fault: ShardFault },
}

impl ResponseMessage {
    pub fn success(target: CookieId, payload: impl Into<Vec<u8>>) -> Self {
        Self::Success {
            target,
            payload: payload.into(),
        }
    }

    pub fn failure(target: CookieId, fault: ShardFault) -> Self {
        Self::Failure { target, fault }
    }

    /// Routing cookie carried by either variant.
    pub fn target(&self) -> CookieId {
        match self {
            Self::Success { target, .. } => *target,
            Self::Failure { target, .. } => *target,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// Typed faults a backend can answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ShardFault {
    /// Request body failed validation on the backend
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Addressed data does not exist
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Backend cannot serve right now (leader moved, overloaded)
    #[error("backend unavailable: {message} (retriable: {retriable})")]
    Unavailable { message: String, retriable: bool },

    /// Request arrived outside the session's expected transmit order
    #[error("out of sequence: expected {expected}")]
    OutOfSequence { expected: u64 },

    /// Backend-side internal error
    #[error("internal backend error: {message}")]
    Internal { message: String },
}

impl ShardFault {
    /// Whether the sender may retry the same request verbatim.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Unavailable { retriable, .. } => *retriable,
            Self::OutOfSequence { .. } => true,
            _ => false,
        }
    }
}
