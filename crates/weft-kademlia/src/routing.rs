//! Routing tables.
//!
//! The default [`TreeRoutingTable`] is a binary tree of k-buckets kept as a
//! flat, range-ordered vector of leaves. A full leaf splits in two while
//! its range contains the local node id; a full leaf elsewhere reports
//! [`AddOutcome::Full`] so the node can run the replacement probe (ping the
//! least-recently-seen contact, evict it on timeout, keep it on success).
//!
//! The trait exists because the table is an injection point: the node
//! accepts any implementation with the same contract.

use std::time::Duration;

use weft_types::{Contact, Key, KEY_BITS};

use crate::kbucket::{BucketInsert, KBucket};

/// Result of offering a contact to the routing table.
#[derive(Clone, Debug)]
pub enum AddOutcome {
    /// The contact was inserted into a bucket.
    Added,
    /// The contact was already known; it moved to the tail of its bucket.
    Updated,
    /// The contact was ignored (it is the local node).
    Ignored,
    /// The owning bucket is full and cannot split. The caller should ping
    /// `head` and either evict it (timeout) or keep it (reply).
    Full {
        /// The least-recently-seen contact of the full bucket.
        head: Contact,
    },
}

/// The routing table contract used by the node.
pub trait RoutingTable: Send {
    /// The node id this table is centred on.
    fn local_id(&self) -> Key;

    /// Offer a contact to the table.
    fn add_contact(&mut self, contact: Contact) -> AddOutcome;

    /// Move a contact to the most-recently-seen position of its bucket
    /// (called after the head of a full bucket answered a probe).
    fn promote(&mut self, id: &Key);

    /// Drop `stale` and insert `newcomer` in its place (called after the
    /// head of a full bucket timed out).
    fn replace(&mut self, stale: &Key, newcomer: Contact);

    /// Remove a contact by id. No-op if absent.
    fn remove_contact(&mut self, id: &Key);

    /// Look up a known contact by id.
    fn get_contact(&self, id: &Key) -> Option<Contact>;

    /// Up to `count` known contacts closest to `key`, never including the
    /// local node or `exclude`.
    fn find_close_nodes(&self, key: &Key, count: usize, exclude: Option<&Key>) -> Vec<Contact>;

    /// Stamp the bucket owning `key` as just accessed.
    fn touch_bucket(&mut self, key: &Key);

    /// Indices of buckets idle for at least `refresh_timeout` (all
    /// non-empty buckets when `force` is set).
    fn stale_buckets(&self, refresh_timeout: Duration, force: bool) -> Vec<usize>;

    /// A random key inside the range of bucket `index`.
    fn random_key_in_bucket(&self, index: usize) -> Option<Key>;

    /// Total number of contacts across all buckets.
    fn contact_count(&self) -> usize;

    /// Number of buckets.
    fn bucket_count(&self) -> usize;
}

/// The default tree routing table.
pub struct TreeRoutingTable {
    local_id: Key,
    k: usize,
    /// Leaf buckets ordered by range; ranges partition the key space.
    buckets: Vec<KBucket>,
}

impl TreeRoutingTable {
    /// Create a table with a single bucket covering the whole key space.
    pub fn new(local_id: Key, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![KBucket::new(Key::from_array([0u8; 20]), 0, k)],
        }
    }

    fn owning_index(&self, key: &Key) -> usize {
        // The ranges partition the space, so exactly one bucket covers any
        // key; fall back to 0 defensively.
        self.buckets
            .iter()
            .position(|b| b.covers(key))
            .unwrap_or(0)
    }

    fn collect_bucket(&self, index: usize, exclude: Option<&Key>, out: &mut Vec<Contact>) {
        for contact in self.buckets[index].contacts() {
            if exclude.is_some_and(|ex| *ex == contact.id) {
                continue;
            }
            out.push(contact.clone());
        }
    }
}

impl RoutingTable for TreeRoutingTable {
    fn local_id(&self) -> Key {
        self.local_id
    }

    fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.local_id {
            return AddOutcome::Ignored;
        }
        loop {
            let index = self.owning_index(&contact.id);
            match self.buckets[index].add(contact.clone()) {
                BucketInsert::Added => return AddOutcome::Added,
                BucketInsert::Refreshed => return AddOutcome::Updated,
                BucketInsert::Full => {
                    let bucket = &self.buckets[index];
                    if bucket.covers(&self.local_id) && bucket.prefix_len() < KEY_BITS {
                        let removed = self.buckets.remove(index);
                        let (low, high) = removed.split();
                        self.buckets.insert(index, high);
                        self.buckets.insert(index, low);
                        continue;
                    }
                    return match bucket.head() {
                        Some(head) => AddOutcome::Full { head: head.clone() },
                        None => AddOutcome::Ignored,
                    };
                }
            }
        }
    }

    fn promote(&mut self, id: &Key) {
        let index = self.owning_index(id);
        self.buckets[index].move_to_tail(id);
    }

    fn replace(&mut self, stale: &Key, newcomer: Contact) {
        let index = self.owning_index(stale);
        self.buckets[index].remove(stale);
        self.add_contact(newcomer);
    }

    fn remove_contact(&mut self, id: &Key) {
        let index = self.owning_index(id);
        self.buckets[index].remove(id);
    }

    fn get_contact(&self, id: &Key) -> Option<Contact> {
        let index = self.owning_index(id);
        self.buckets[index].get(id).cloned()
    }

    fn find_close_nodes(&self, key: &Key, count: usize, exclude: Option<&Key>) -> Vec<Contact> {
        let owning = self.owning_index(key);
        let mut collected = Vec::new();
        self.collect_bucket(owning, exclude, &mut collected);

        // Widen outward over neighbouring ranges until enough contacts are
        // gathered or the table is exhausted.
        let mut step = 1usize;
        while collected.len() < count {
            let below = owning.checked_sub(step);
            let above = owning + step;
            if below.is_none() && above >= self.buckets.len() {
                break;
            }
            if let Some(b) = below {
                self.collect_bucket(b, exclude, &mut collected);
            }
            if above < self.buckets.len() {
                self.collect_bucket(above, exclude, &mut collected);
            }
            step += 1;
        }

        collected.sort_by_key(|c| c.id.distance(key));
        collected.truncate(count);
        collected
    }

    fn touch_bucket(&mut self, key: &Key) {
        let index = self.owning_index(key);
        self.buckets[index].touch();
    }

    fn stale_buckets(&self, refresh_timeout: Duration, force: bool) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && (force || b.idle_for() >= refresh_timeout))
            .map(|(i, _)| i)
            .collect()
    }

    fn random_key_in_bucket(&self, index: usize) -> Option<Key> {
        self.buckets.get(index).map(KBucket::random_key_in_range)
    }

    fn contact_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
