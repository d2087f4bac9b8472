//! # weft-transport
//!
//! Datagram RPC transport for the Weft DHT.
//!
//! This crate provides:
//! - **CBOR serialization** helpers via [`codec`]
//! - **Wire message types** (the request/response/error envelope and the
//!   primitive value tree) via [`wire`]
//! - **The RPC endpoint** (UDP socket, pending-request map, timeouts,
//!   handler dispatch) via [`rpc`]
//!
//! ## Architecture
//!
//! ```text
//! Node / overlays
//!     |
//!     v
//! RpcEndpoint (rpc.rs)   -- pending map, timeouts, dispatch table
//!     |
//!     v
//! Message (wire.rs)      -- CBOR envelope: Request | Response | Error
//!     |
//!     v
//! UDP socket
//! ```
//!
//! The payload encoding is CBOR: a self-describing format that preserves
//! integers, byte strings, ordered sequences and key-value maps, which is
//! all the protocol requires of its codec.

pub mod codec;
pub mod rpc;
pub mod wire;

use weft_types::Key;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (oversized payload, malformed envelope).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No response within the RPC timeout. Carries the node id the request
    /// was addressed to, so callers can evict the dead contact.
    #[error("rpc timed out contacting {node_id}")]
    Timeout {
        /// The destination's (believed) node id.
        node_id: Key,
    },

    /// An error raised by the remote handler, re-raised locally with the
    /// original kind preserved.
    #[error("remote error ({kind}): {text}")]
    Remote { kind: String, text: String },

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");
    }

    #[test]
    fn test_timeout_carries_node_id() {
        let id = Key::generate();
        let err = TransportError::Timeout { node_id: id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
