//! shardwire - Wire-level protocol types for the shardline client.
//!
//! This crate defines the messages exchanged between a client and the
//! backend shards of a distributed data store. Requests travel inside a
//! `RequestEnvelope` stamped with a session id and a per-session transmit
//! sequence; responses come back in a `ResponseEnvelope` carrying the same
//! correlation pair plus backend execution timing. The payload of a request
//! is opaque at this layer - higher layers own operation serialization.
//!
//! Pure data crate: serde types, no async code, no transport.

pub mod abi;
pub mod backend;
pub mod envelope;
pub mod request;

pub use abi::AbiVersion;
pub use backend::{BackendInfo, ClientIdentifier, CookieId};
pub use envelope::{RequestEnvelope, ResponseEnvelope, ResponseMessage, ShardFault};
pub use request::ShardRequest;

use thiserror::Error;

/// Errors raised while validating wire-level values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unsupported ABI version: {0:#06x}")]
    UnsupportedAbiVersion(u16),
}
