//! Error types for cache operations.

use std::fmt;

/// Errors that can occur constructing cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The packet is shorter than its header declares.
    PacketTruncated,

    /// The header's key does not fit inside the packet body.
    KeyOutOfBounds,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTruncated => write!(f, "packet shorter than declared body length"),
            Self::KeyOutOfBounds => write!(f, "key extends past packet body"),
        }
    }
}

impl std::error::Error for CacheError {}
