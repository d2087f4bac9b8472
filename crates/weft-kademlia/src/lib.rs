//! # weft-kademlia
//!
//! The Kademlia core of the Weft DHT: routing table, data stores, and the
//! iterative lookup engine behind every network operation.
//!
//! This crate implements:
//! - Tree routing table with XOR-distance metric and bucket splitting
//! - Replacement probing for full buckets (ping the least-recently-seen
//!   contact, evict on timeout)
//! - Iterative FIND_NODE / FIND_VALUE / STORE / DELETE with bounded
//!   parallelism
//! - Join/bootstrap, periodic bucket refresh, and the
//!   republish/replicate/expire lifecycle of stored items
//! - In-memory and SQLite-backed data stores
//!
//! ## Key Parameters
//!
//! | Parameter | Default |
//! |---|---|
//! | k (bucket size, replication factor) | 8 |
//! | alpha (lookup parallelism) | 3 |
//! | RPC timeout | 20 s |
//! | Iterative lookup delay | 2/3 of the RPC timeout |
//! | Bucket refresh timeout | 1 hour |
//! | Refresh check interval | 15 minutes |
//! | Data expiry | 24 hours |
//! | Replicate interval | 1 hour |
//! | Identifier length | 160 bits (SHA-1) |

pub mod config;
pub mod kbucket;
mod lookup;
pub mod node;
pub mod routing;
pub mod store;

use weft_transport::rpc::RpcFault;
use weft_transport::TransportError;

pub use config::NodeConfig;
pub use lookup::{FindOutcome, FoundValue};
pub use node::Node;
pub use routing::{AddOutcome, RoutingTable, TreeRoutingTable};
pub use store::{DataStore, MemoryStore, SqliteStore};
pub use weft_types::{Contact, Key, KEY_BITS, KEY_LEN};

/// Bucket size and replication factor.
pub const K: usize = 8;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// RPC timeout in milliseconds.
pub const RPC_TIMEOUT_MS: u64 = 20_000;

/// Bucket refresh timeout in milliseconds (1 hour).
pub const REFRESH_TIMEOUT_MS: u64 = 3_600_000;

/// Interval between refresh checks in milliseconds (15 minutes).
pub const CHECK_REFRESH_INTERVAL_MS: u64 = 900_000;

/// Lifetime of a stored item in milliseconds (24 hours).
pub const DATA_EXPIRE_TIMEOUT_MS: u64 = 86_400_000;

/// Replication re-push interval in milliseconds (1 hour).
pub const REPLICATE_INTERVAL_MS: u64 = 3_600_000;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// An RPC timed out. Carries the destination node id so the routing
    /// table and the lookup shortlist can evict it.
    #[error("rpc timed out contacting {node_id}")]
    Timeout {
        /// The destination's (believed) node id.
        node_id: Key,
    },

    /// The peer does not expose the requested RPC method.
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// A STORE arrived without an explicit publisher and without an RPC
    /// sender id to fall back on.
    #[error("no publisher specified and no rpc sender id available")]
    MissingPublisher,

    /// An error raised by a remote handler, with its kind preserved.
    #[error("remote error ({kind}): {text}")]
    Remote { kind: String, text: String },

    /// An RPC payload did not match the expected shape.
    #[error("malformed rpc payload: {0}")]
    Protocol(String),

    /// Data store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (socket, codec).
    #[error("transport failure: {0}")]
    Transport(String),
}

impl DhtError {
    /// The error kind name carried on the wire in error replies.
    pub fn kind_name(&self) -> &str {
        match self {
            DhtError::Timeout { .. } => "Timeout",
            DhtError::InvalidMethod(_) => "InvalidMethod",
            DhtError::MissingPublisher => "MissingPublisher",
            DhtError::Remote { kind, .. } => kind,
            DhtError::Protocol(_) => "Protocol",
            DhtError::Storage(_) => "Storage",
            DhtError::Config(_) => "Config",
            DhtError::Transport(_) => "Transport",
        }
    }

    /// Convert into an RPC fault for an error reply.
    pub fn to_fault(&self) -> RpcFault {
        RpcFault::new(self.kind_name().to_string(), self.to_string())
    }
}

impl From<TransportError> for DhtError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { node_id } => DhtError::Timeout { node_id },
            // Best-effort mapping of remote error kinds back to native
            // variants; unknown kinds stay as remote errors.
            TransportError::Remote { kind, text } => match kind.as_str() {
                "InvalidMethod" => DhtError::InvalidMethod(text),
                "MissingPublisher" => DhtError::MissingPublisher,
                _ => DhtError::Remote { kind, text },
            },
            other => DhtError::Transport(other.to_string()),
        }
    }
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(K, 8);
        assert_eq!(ALPHA, 3);
        assert_eq!(RPC_TIMEOUT_MS, 20_000);
        assert_eq!(REFRESH_TIMEOUT_MS, 3_600_000);
        assert_eq!(CHECK_REFRESH_INTERVAL_MS, 900_000);
        assert_eq!(DATA_EXPIRE_TIMEOUT_MS, 86_400_000);
        assert_eq!(REPLICATE_INTERVAL_MS, 3_600_000);
    }

    #[test]
    fn test_timeout_maps_from_transport() {
        let id = Key::generate();
        let err: DhtError = TransportError::Timeout { node_id: id }.into();
        assert!(matches!(err, DhtError::Timeout { node_id } if node_id == id));
    }

    #[test]
    fn test_remote_kind_mapping() {
        let err: DhtError = TransportError::Remote {
            kind: "InvalidMethod".to_string(),
            text: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, DhtError::InvalidMethod(_)));

        let err: DhtError = TransportError::Remote {
            kind: "SomethingElse".to_string(),
            text: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, DhtError::Remote { ref kind, .. } if kind == "SomethingElse"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(DhtError::MissingPublisher.kind_name(), "MissingPublisher");
        assert_eq!(
            DhtError::InvalidMethod("x".to_string()).kind_name(),
            "InvalidMethod"
        );
    }
}
