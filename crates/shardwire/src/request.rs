//! Request messages addressed to a backend shard.

use serde::{Deserialize, Serialize};

use crate::backend::CookieId;

/// A single request addressed to one backend shard.
///
/// The payload is opaque to the connection core - transaction assembly
/// above this layer serializes the actual operation (read, exists, modify,
/// commit) into it. The target cookie is what the client routes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRequest {
    /// Backend shard this request is addressed to
    pub target: CookieId,
    /// Serialized operation body
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ShardRequest {
    pub fn new(target: CookieId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_serialization() {
        let req = ShardRequest::new(CookieId(7), b"read /inventory".to_vec());
        let json = serde_json::to_string(&req).unwrap();
        let back: ShardRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
        assert_eq!(back.target, CookieId(7));
    }
}
