//! # weft-types
//!
//! Shared base types for the Weft distributed hash table: the 160-bit
//! identifier space with its XOR distance metric, and the [`Contact`]
//! peer handle used by the routing layer and the RPC transport.

pub mod contact;
pub mod key;

pub use contact::Contact;
pub use key::{Distance, Key, KEY_BITS, KEY_LEN};
