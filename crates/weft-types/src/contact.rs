//! Addressable peer handles.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// A known peer: node id, socket address, and the time of the last
/// successful exchange.
///
/// Contacts are value objects: equality, hashing and ordering consider the
/// node id only, so a peer that moves address compares equal to its old
/// incarnation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's 160-bit node id.
    pub id: Key,
    /// The socket address the peer was last heard from.
    pub addr: SocketAddr,
    /// Unix timestamp (seconds) of the last successful exchange.
    pub last_seen: u64,
}

impl Contact {
    /// Create a contact first seen now.
    pub fn new(id: Key, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: unix_now(),
        }
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Contact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Contact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_equality_is_by_id_only() {
        let id = Key::generate();
        let a = Contact::new(id, addr(4000));
        let b = Contact::new(id, addr(5000));
        assert_eq!(a, b);

        let c = Contact::new(Key::generate(), addr(4000));
        assert_ne!(a, c);
    }

    #[test]
    fn test_touch_advances_last_seen() {
        let mut c = Contact::new(Key::generate(), addr(4000));
        c.last_seen = 0;
        c.touch();
        assert!(c.last_seen > 0);
    }
}
