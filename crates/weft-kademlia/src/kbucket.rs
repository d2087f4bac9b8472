//! A single k-bucket.
//!
//! Holds up to `k` contacts covering one aligned sub-range of the
//! identifier space, ordered from least-recently-seen (front) to
//! most-recently-seen (back). The range is an aligned prefix: the bucket
//! covers every key whose first `prefix_len` bits match `prefix`.

use std::collections::VecDeque;
use std::time::Instant;

use weft_types::{Contact, Key};

/// Result of inserting a contact into a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketInsert {
    /// The contact was appended at the most-recently-seen position.
    Added,
    /// The contact was already present and moved to the tail.
    Refreshed,
    /// The bucket is full; the caller decides between splitting and a
    /// replacement probe of the head contact.
    Full,
}

/// A bounded, recency-ordered list of contacts covering a key range.
#[derive(Clone, Debug)]
pub struct KBucket {
    prefix: Key,
    prefix_len: usize,
    capacity: usize,
    contacts: VecDeque<Contact>,
    /// Last time this bucket's range was the subject of a lookup.
    last_accessed: Instant,
}

impl KBucket {
    /// Create an empty bucket covering the range of `prefix`/`prefix_len`.
    pub fn new(prefix: Key, prefix_len: usize, capacity: usize) -> Self {
        Self {
            prefix,
            prefix_len,
            capacity,
            contacts: VecDeque::with_capacity(capacity),
            last_accessed: Instant::now(),
        }
    }

    /// Whether `key` falls inside this bucket's range.
    pub fn covers(&self, key: &Key) -> bool {
        key.has_prefix(&self.prefix, self.prefix_len)
    }

    /// The range prefix.
    pub fn prefix(&self) -> &Key {
        &self.prefix
    }

    /// The range prefix length in bits.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Number of contacts held.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the bucket holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Whether the bucket is at capacity.
    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    /// Whether a contact with this id is present.
    pub fn contains(&self, id: &Key) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    /// Get a contact by id.
    pub fn get(&self, id: &Key) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    /// The least-recently-seen contact.
    pub fn head(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    /// Insert or refresh a contact.
    ///
    /// An already-known id moves to the tail with its address and
    /// last-seen time updated; a new id is appended if there is room.
    pub fn add(&mut self, contact: Contact) -> BucketInsert {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            let mut refreshed = contact;
            refreshed.touch();
            self.contacts.push_back(refreshed);
            return BucketInsert::Refreshed;
        }
        if self.is_full() {
            return BucketInsert::Full;
        }
        self.contacts.push_back(contact);
        BucketInsert::Added
    }

    /// Remove a contact by id.
    pub fn remove(&mut self, id: &Key) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| c.id == *id)?;
        self.contacts.remove(pos)
    }

    /// Move an existing contact to the most-recently-seen position.
    pub fn move_to_tail(&mut self, id: &Key) {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            if let Some(mut contact) = self.contacts.remove(pos) {
                contact.touch();
                self.contacts.push_back(contact);
            }
        }
    }

    /// Iterate the contacts from least to most recently seen.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Split this bucket into the two halves of its range, redistributing
    /// its contacts. Only valid while `prefix_len < 160`.
    pub fn split(self) -> (KBucket, KBucket) {
        let child_len = self.prefix_len + 1;
        let mut low = KBucket::new(self.prefix.with_bit(self.prefix_len, false), child_len, self.capacity);
        let mut high = KBucket::new(self.prefix.with_bit(self.prefix_len, true), child_len, self.capacity);
        low.last_accessed = self.last_accessed;
        high.last_accessed = self.last_accessed;
        for contact in self.contacts {
            if contact.id.bit(self.prefix_len) {
                high.contacts.push_back(contact);
            } else {
                low.contacts.push_back(contact);
            }
        }
        (low, high)
    }

    /// A random key inside this bucket's range, for refresh lookups.
    pub fn random_key_in_range(&self) -> Key {
        Key::random_with_prefix(&self.prefix, self.prefix_len)
    }

    /// Stamp the bucket as just accessed.
    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    /// How long ago the bucket was last accessed.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_accessed.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn contact(byte: u8) -> Contact {
        let mut id = [0u8; 20];
        id[0] = byte;
        Contact::new(
            Key::from_array(id),
            SocketAddr::from(([127, 0, 0, 1], 4000 + u16::from(byte))),
        )
    }

    fn root_bucket(capacity: usize) -> KBucket {
        KBucket::new(Key::from_array([0u8; 20]), 0, capacity)
    }

    #[test]
    fn test_add_and_refresh() {
        let mut bucket = root_bucket(4);
        assert_eq!(bucket.add(contact(1)), BucketInsert::Added);
        assert_eq!(bucket.add(contact(2)), BucketInsert::Added);
        assert_eq!(bucket.len(), 2);

        // Re-adding an existing id moves it to the tail.
        assert_eq!(bucket.add(contact(1)), BucketInsert::Refreshed);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.head().map(|c| c.id), Some(contact(2).id));
    }

    #[test]
    fn test_full_bucket_signals() {
        let mut bucket = root_bucket(2);
        bucket.add(contact(1));
        bucket.add(contact(2));
        assert_eq!(bucket.add(contact(3)), BucketInsert::Full);
        assert_eq!(bucket.len(), 2);
        assert!(!bucket.contains(&contact(3).id));
    }

    #[test]
    fn test_remove_and_move_to_tail() {
        let mut bucket = root_bucket(4);
        bucket.add(contact(1));
        bucket.add(contact(2));
        bucket.add(contact(3));

        bucket.move_to_tail(&contact(1).id);
        assert_eq!(bucket.head().map(|c| c.id), Some(contact(2).id));

        assert!(bucket.remove(&contact(2).id).is_some());
        assert!(bucket.remove(&contact(2).id).is_none());
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_split_redistributes_by_bit() {
        let mut bucket = root_bucket(8);
        let mut low_id = [0u8; 20];
        low_id[0] = 0x01;
        let mut high_id = [0u8; 20];
        high_id[0] = 0x81;
        let low_contact = Contact::new(Key::from_array(low_id), SocketAddr::from(([127, 0, 0, 1], 1)));
        let high_contact = Contact::new(Key::from_array(high_id), SocketAddr::from(([127, 0, 0, 1], 2)));
        bucket.add(low_contact.clone());
        bucket.add(high_contact.clone());

        let (low, high) = bucket.split();
        assert_eq!(low.prefix_len(), 1);
        assert_eq!(high.prefix_len(), 1);
        assert!(low.contains(&low_contact.id));
        assert!(high.contains(&high_contact.id));
        assert!(low.covers(&low_contact.id));
        assert!(high.covers(&high_contact.id));
        assert!(!low.covers(&high_contact.id));
    }

    #[test]
    fn test_random_key_in_range() {
        let bucket = KBucket::new(Key::from_array([0xA5u8; 20]), 9, 8);
        for _ in 0..32 {
            assert!(bucket.covers(&bucket.random_key_in_range()));
        }
    }
}
