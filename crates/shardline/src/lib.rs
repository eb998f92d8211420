//! shardline - per-backend connection core for a distributed data-store
//! client.
//!
//! A client talks to one or more remote backend shards over an
//! asynchronous message substrate. For each backend (identified by a
//! stable cookie) the core maintains a single logical connection that
//! queues outgoing requests, dispatches them once the backend endpoint is
//! resolved, enforces liveness and per-request timeouts, applies
//! backpressure to producers, and transparently replays in-flight
//! requests across backend reconnections.
//!
//! # Architecture
//!
//! - Producers call [`Connection::send_request`] from any task; the only
//!   suspension point is the post-enqueue backpressure sleep.
//! - A single [`ClientBehavior`] event loop applies response envelopes,
//!   timer callbacks, and resolution results in arrival order.
//! - Three timer tiers guard progress: backend aliveness (30 s) forces a
//!   reconnect, the per-request timeout (2 min) fails individual entries,
//!   and the no-progress window (15 min) poisons a connection terminally.
//!
//! The transport and the backend directory are seams
//! ([`MessageTransport`], [`BackendInfoResolver`]); the core never owns a
//! socket.

pub mod behavior;
pub mod clock;
pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
mod queue;
pub mod resolver;
pub mod transport;

pub use behavior::{ClientBehavior, ClientContext, ClientEvent};
pub use clock::{ManualTicker, MonotonicTicker, Ticker};
pub use config::ClientConfig;
pub use connection::{
    Connection, BACKEND_ALIVE_TIMEOUT_NANOS, DEBUG_DELAY_NANOS, MAX_DELAY_NANOS,
    NO_PROGRESS_TIMEOUT_NANOS, REQUEST_TIMEOUT_NANOS,
};
pub use entry::ResponseCallback;
pub use error::{ConnectionFailure, PoisonedError, RequestError, ResolverError};
pub use resolver::{BackendInfoResolver, StaticResolver};
pub use transport::{MessageTransport, NullTransport};
