//! # weft-space
//!
//! The two higher-level services layered on the Weft DHT:
//!
//! - a **keyword overlay** ([`keyword`]): name-keyed publishing with
//!   split-keyword inverted indexes for substring-free search;
//! - a **distributed tuple space** ([`space`]): content-addressed tuples,
//!   wildcard template matching through per-position sub-key indexes, and
//!   blocking rendezvous between producers and consumers that may not yet
//!   coexist.
//!
//! Both overlays speak plain DHT operations; the tuple space additionally
//! registers one RPC of its own (`receive_tuple`) for direct delivery to a
//! waiting listener. Tuple records and listener records live in disjoint
//! key namespaces (`"tuple:"` / `"listener:"` hash prefixes) sharing the
//! same DHT routing.

pub mod keyword;
pub mod space;
pub mod tuple;

use weft_kademlia::DhtError;

pub use keyword::KeywordOverlay;
pub use space::{PutOutcome, TupleSpacePeer};
pub use tuple::{Namespace, Template, TemplateSlot, Tuple, TupleValue, TypeTag};

/// Error types for overlay operations.
#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    /// Tuple or record (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// An underlying DHT operation failed.
    #[error(transparent)]
    Dht(#[from] DhtError),

    /// A DHT record did not have the shape the overlay expected.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A blocking request was withdrawn before a tuple was delivered.
    #[error("listener dropped before delivery")]
    ListenerDropped,
}

/// Convenience result type for overlay operations.
pub type Result<T> = std::result::Result<T, SpaceError>;
