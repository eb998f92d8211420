//! Transport seam.
//!
//! The connection core does not own sockets; it hands fully-stamped request
//! envelopes to whatever substrate the embedding application runs on. The
//! single method must not block - implementations enqueue onto their own
//! machinery (a channel, a mailbox) and return.

use shardwire::RequestEnvelope;

/// Outbound half of the message substrate.
pub trait MessageTransport: Send + Sync {
    /// Hand an envelope to the substrate for delivery to `endpoint`.
    ///
    /// Called under a connection lock on enqueue and timer paths; must not
    /// block or re-enter the connection.
    fn send_envelope(&self, endpoint: &str, envelope: RequestEnvelope);
}

/// Transport that drops everything, for wiring up a client before its
/// substrate exists.
#[derive(Debug, Default)]
pub struct NullTransport;

impl MessageTransport for NullTransport {
    fn send_envelope(&self, _endpoint: &str, _envelope: RequestEnvelope) {}
}
