//! Backend ABI versioning.
//!
//! A backend advertises the message shape it speaks as part of its resolved
//! descriptor. The client checks the tag once, when resolution completes,
//! and every envelope built for that backend afterwards is bounded by it.

use serde::{Deserialize, Serialize};

use crate::WireError;

/// ABI version tag carried in a resolved backend descriptor (2 bytes on
/// the wire, big-endian).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiVersion {
    /// Initial envelope shape
    V1 = 0x0001,
    /// Adds execution timing to response envelopes
    V2 = 0x0002,
}

impl AbiVersion {
    /// Newest version this client speaks.
    pub const CURRENT: AbiVersion = AbiVersion::V2;

    /// Oldest version this client still speaks. V1 envelopes lack
    /// execution timing and are no longer produced.
    pub const MIN_SUPPORTED: AbiVersion = AbiVersion::V2;

    /// Parse a u16 into an AbiVersion
    pub fn from_u16(value: u16) -> Result<Self, WireError> {
        match value {
            0x0001 => Ok(AbiVersion::V1),
            0x0002 => Ok(AbiVersion::V2),
            other => Err(WireError::UnsupportedAbiVersion(other)),
        }
    }

    /// Convert AbiVersion to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this client can build envelopes for a backend speaking
    /// this version.
    pub fn is_supported(self) -> bool {
        Self::MIN_SUPPORTED <= self && self <= Self::CURRENT
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.to_u16())
    }
}
