//! Peer identity
//!
//! Every smart object is known on the medium by its 64-bit agency UID.
//! Identities are totally ordered; the order decides who initiates a PING
//! and who yields when two speaker claims carry the same tie-break value.

use std::fmt;

/// Opaque identity of a node on the shared medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Size of an encoded peer identity in bytes
    pub const SIZE: usize = 8;

    /// Create a peer identity from a raw agency UID
    #[inline]
    pub const fn new(raw: u64) -> Self {
        PeerId(raw)
    }

    /// Get the raw agency UID
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        PeerId(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
