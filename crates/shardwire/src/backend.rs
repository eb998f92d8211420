//! Backend and client identity types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::abi::AbiVersion;

/// Opaque stable identifier for one backend shard within a client.
///
/// Cookies never change for the lifetime of a client; the backend behind a
/// cookie may move between endpoints as shards fail over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CookieId(pub u64);

impl std::fmt::Display for CookieId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Identity of one client instance, used to tag log output and to scope
/// sessions on the backend side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentifier {
    /// Human-readable client role name (e.g. "frontend-datastore")
    pub name: String,
    /// Unique instance id, fresh per process
    pub instance: Uuid,
}

impl ClientIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.instance)
    }
}

/// Resolved descriptor of a backend shard.
///
/// Produced by the directory layer when a cookie is resolved to a live
/// backend instance. `max_messages` is the backend's in-flight window: the
/// number of requests it is willing to hold unanswered for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Substrate address of the shard leader (e.g. "actor://member-1/shard-12")
    pub endpoint: String,
    /// Backend name for log output
    pub name: String,
    /// Message shape the backend speaks
    pub abi_version: AbiVersion,
    /// In-flight window advertised by the backend
    pub max_messages: usize,
}

impl BackendInfo {
    pub fn new(
        endpoint: impl Into<String>,
        name: impl Into<String>,
        abi_version: AbiVersion,
        max_messages: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            name: name.into(),
            abi_version,
            max_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cookie_display() {
        assert_eq!(CookieId(12).to_string(), "shard-12");
    }

    #[test]
    fn client_identifier_is_unique_per_instance() {
        let a = ClientIdentifier::new("frontend");
        let b = ClientIdentifier::new("frontend");
        assert_eq!(a.name, b.name);
        assert_ne!(a.instance, b.instance);
    }

    #[test]
    fn backend_info_serialization() {
        let info = BackendInfo::new("actor://member-1/shard-3", "shard-3", AbiVersion::V2, 1000);
        let json = serde_json::to_string(&info).unwrap();
        let back: BackendInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
