//! The distributed tuple space.
//!
//! Tuples are stored content-addressed under their main key, with
//! inverted-index records (one per sub-key) making them findable by
//! wildcard templates. Consumers that find no matching tuple register a
//! *listener* record in the disjoint listener namespace and block; a
//! producer checks for listeners before storing and, on a hit, withdraws
//! the listener and delivers the tuple directly over the `receive_tuple`
//! RPC.
//!
//! The rendezvous is best-effort: a producer that observes no listener may
//! proceed to store just as a consumer that observes no tuple registers a
//! listener. Producers check listeners before the store and consumers
//! register before awaiting, which narrows but does not close the race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;

use weft_kademlia::{FindOutcome, Node};
use weft_transport::codec;
use weft_transport::rpc::{HandlerFuture, RpcContext, RpcFault};
use weft_transport::wire::Value;
use weft_types::{Key, KEY_LEN};

use crate::tuple::{
    decode_tuple, encode_tuple, listener_template_key, main_key, template_subkeys, tuple_subkeys,
    Namespace, Template, Tuple, SUBKEY_VARIANTS_PER_POSITION,
};
use crate::{Result, SpaceError};

/// Reply from `receive_tuple`: the tuple satisfied a destructive get.
const REPLY_GET: &str = "get";
/// Reply from `receive_tuple`: the tuple satisfied a non-destructive read.
const REPLY_READ: &str = "read";
/// Reply from `receive_tuple`: no waiter was found for the listener key.
const REPLY_NONE: &str = "none";

/// What happened to a tuple handed to [`TupleSpacePeer::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// A blocked `get` consumed the tuple; nothing was stored.
    Delivered,
    /// A blocked `read` copied the tuple, and it was stored as well.
    DeliveredAndStored,
    /// No listener existed; the tuple was stored and indexed.
    Stored,
}

enum Waiter {
    Get(oneshot::Sender<Tuple>),
    Read {
        tx: oneshot::Sender<Vec<Tuple>>,
    },
}

/// A DHT node participating in the distributed tuple space.
#[derive(Clone)]
pub struct TupleSpacePeer {
    node: Node,
    pending: Arc<Mutex<HashMap<Key, Waiter>>>,
}

impl TupleSpacePeer {
    /// Wrap a node and expose the `receive_tuple` RPC on it.
    pub fn new(node: Node) -> Self {
        let pending: Arc<Mutex<HashMap<Key, Waiter>>> = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&pending);
        node.register_handler(
            "receive_tuple",
            Arc::new(move |ctx: RpcContext| -> HandlerFuture {
                let table = Arc::clone(&table);
                Box::pin(async move { receive_tuple(&table, ctx) })
            }),
        );
        Self { node, pending }
    }

    /// The underlying node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Number of blocked requests currently waiting for a tuple.
    pub fn waiting_requests(&self) -> usize {
        self.pending
            .lock()
            .expect("listener table lock poisoned")
            .len()
    }

    /// Write a tuple into the tuple space.
    ///
    /// A waiting *get* listener consumes the tuple directly and nothing is
    /// stored; a waiting *read* listener receives a copy and the tuple is
    /// stored as well; with no listener the tuple is stored and indexed.
    pub async fn put(&self, tuple: &Tuple) -> Result<PutOutcome> {
        if let Some(blob) = self.find_listener_record(tuple).await? {
            let (listener_node, listener_key) = split_listener_blob(&blob)?;

            // Withdraw the listener before delivering, so a second
            // producer does not race to the same consumer.
            self.node.iterative_delete(&listener_key).await;
            let listener_subkeys = tuple_subkeys(Namespace::Listener, tuple)?;
            self.remove_from_inverted_indexes(&listener_subkeys, &blob)
                .await?;

            let contact = match self.node.known_contact(&listener_node) {
                Some(contact) => Some(contact),
                None => self
                    .node
                    .iterative_find_node(&listener_node)
                    .await
                    .into_iter()
                    .find(|c| c.id == listener_node),
            };

            if let Some(contact) = contact {
                let args = vec![
                    Value::key(&listener_key),
                    Value::Bytes(encode_tuple(tuple)?),
                ];
                match self.node.call(&contact, "receive_tuple", args).await {
                    Ok(raw) => match raw.result.as_str() {
                        Some(REPLY_GET) => return Ok(PutOutcome::Delivered),
                        Some(REPLY_READ) => {
                            // The reader left the tuple in place, so it
                            // still has to exist in the space.
                            self.store_tuple(tuple).await?;
                            return Ok(PutOutcome::DeliveredAndStored);
                        }
                        _ => {}
                    },
                    Err(e) => {
                        debug!(peer = %contact, error = %e, "direct tuple delivery failed");
                    }
                }
            }
        }

        self.store_tuple(tuple).await?;
        Ok(PutOutcome::Stored)
    }

    /// Read and remove a matching tuple, blocking until one exists.
    pub async fn get(&self, template: &Template) -> Result<Tuple> {
        if let Some(tuple) = self.get_if_exists(template).await? {
            return Ok(tuple);
        }
        let rx = self.register_get_listener(template).await?;
        rx.await.map_err(|_| SpaceError::ListenerDropped)
    }

    /// Read and remove a matching tuple if one exists right now.
    pub async fn get_if_exists(&self, template: &Template) -> Result<Option<Tuple>> {
        let Some(main) = self.find_one_tuple_key(template).await? else {
            return Ok(None);
        };
        // Plain search here: a destructive read must not seed fresh
        // replicas of the value it is about to delete.
        let Some(bytes) = self.fetch_value(&main, false).await else {
            return Ok(None);
        };
        let tuple = decode_tuple(&bytes)?;
        self.node.iterative_delete(&main).await;
        let subkeys = tuple_subkeys(Namespace::Tuple, &tuple)?;
        self.remove_from_inverted_indexes(&subkeys, main.as_bytes())
            .await?;
        Ok(Some(tuple))
    }

    /// Copy a matching tuple without removing it, blocking until one
    /// exists.
    pub async fn read(&self, template: &Template) -> Result<Tuple> {
        if let Some(tuple) = self.read_if_exists(template).await? {
            return Ok(tuple);
        }
        let rx = self.register_read_listener(template).await?;
        let mut tuples = rx.await.map_err(|_| SpaceError::ListenerDropped)?;
        tuples.pop().ok_or(SpaceError::ListenerDropped)
    }

    /// Copy a matching tuple without removing it, if one exists right now.
    pub async fn read_if_exists(&self, template: &Template) -> Result<Option<Tuple>> {
        let Some(main) = self.find_one_tuple_key(template).await? else {
            return Ok(None);
        };
        match self.fetch_value(&main, true).await {
            Some(bytes) => Ok(Some(decode_tuple(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Copy up to `limit` matching tuples (0 = all), blocking for a single
    /// match when none exist yet.
    pub async fn read_many(&self, template: &Template, limit: usize) -> Result<Vec<Tuple>> {
        if let Some(tuples) = self.read_many_if_exists(template, limit).await? {
            return Ok(tuples);
        }
        let rx = self.register_read_listener(template).await?;
        rx.await.map_err(|_| SpaceError::ListenerDropped)
    }

    /// Copy up to `limit` matching tuples (0 = all) if any exist right now.
    pub async fn read_many_if_exists(
        &self,
        template: &Template,
        limit: usize,
    ) -> Result<Option<Vec<Tuple>>> {
        let Some(keys) = self.find_tuple_keys(template).await? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for key in keys {
            if limit != 0 && out.len() == limit {
                break;
            }
            if let Some(bytes) = self.fetch_value(&key, true).await {
                out.push(decode_tuple(&bytes)?);
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    /// Withdraw a previously registered listener for this template, so a
    /// later `put` proceeds to storage instead of delivering.
    ///
    /// Returns whether a listener record was found and removed.
    pub async fn withdraw_listener(&self, template: &Template) -> Result<bool> {
        let listener_key = listener_template_key(template)?;
        let subkeys = template_subkeys(Namespace::Listener, template)?;

        let blob = match &subkeys {
            // Deterministic template: a single record under the listener key.
            None => self.fetch_value(&listener_key, false).await,
            // Wildcard template: every registration wrote all of its
            // sub-key indexes, so scanning the first one suffices.
            Some(keys) => {
                let mut found = None;
                if let Some(first) = keys.first() {
                    if let Some(bytes) = self.fetch_value(first, false).await {
                        if let Ok(entries) = decode_index(&bytes) {
                            found = entries.into_iter().find(|e| {
                                e.len() == 2 * KEY_LEN
                                    && &e[KEY_LEN..] == listener_key.as_bytes().as_slice()
                            });
                        }
                    }
                }
                found
            }
        };

        let Some(blob) = blob else {
            return Ok(false);
        };
        self.node.iterative_delete(&listener_key).await;
        if let Some(keys) = subkeys {
            self.remove_from_inverted_indexes(&keys, &blob).await?;
        }
        self.pending
            .lock()
            .expect("listener table lock poisoned")
            .remove(&listener_key);
        Ok(true)
    }

    // === Internals ===

    /// Store the tuple under its main key and index it under every
    /// sub-key.
    async fn store_tuple(&self, tuple: &Tuple) -> Result<Key> {
        let key = main_key(Namespace::Tuple, tuple)?;
        self.node.iterative_store(&key, encode_tuple(tuple)?).await?;
        let subkeys = tuple_subkeys(Namespace::Tuple, tuple)?;
        self.add_to_inverted_indexes(&subkeys, key.as_bytes()).await?;
        Ok(key)
    }

    /// Register a blocking get: local waiter first, listener records after,
    /// so a delivery arriving mid-registration finds the waiter in place.
    async fn register_get_listener(&self, template: &Template) -> Result<oneshot::Receiver<Tuple>> {
        let listener_key = listener_template_key(template)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("listener table lock poisoned")
            .insert(listener_key, Waiter::Get(tx));
        if let Err(e) = self.write_listener_records(template, &listener_key).await {
            self.pending
                .lock()
                .expect("listener table lock poisoned")
                .remove(&listener_key);
            return Err(e);
        }
        Ok(rx)
    }

    async fn register_read_listener(
        &self,
        template: &Template,
    ) -> Result<oneshot::Receiver<Vec<Tuple>>> {
        let listener_key = listener_template_key(template)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("listener table lock poisoned")
            .insert(listener_key, Waiter::Read { tx });
        if let Err(e) = self.write_listener_records(template, &listener_key).await {
            self.pending
                .lock()
                .expect("listener table lock poisoned")
                .remove(&listener_key);
            return Err(e);
        }
        Ok(rx)
    }

    /// Publish the listener into the DHT: a single record for a
    /// deterministic template, inverted-index entries otherwise. The value
    /// is always `self.id ∥ listener_key`.
    async fn write_listener_records(&self, template: &Template, listener_key: &Key) -> Result<()> {
        let mut blob = self.node.id().to_vec();
        blob.extend_from_slice(listener_key.as_bytes());
        match template_subkeys(Namespace::Listener, template)? {
            None => {
                self.node.iterative_store(listener_key, blob).await?;
            }
            Some(subkeys) => {
                self.add_to_inverted_indexes(&subkeys, &blob).await?;
            }
        }
        Ok(())
    }

    /// Find the record of a listener waiting for this tuple, if any.
    async fn find_listener_record(&self, tuple: &Tuple) -> Result<Option<Vec<u8>>> {
        // Exact match first: a deterministic-template listener lives under
        // the tuple's own listener main key.
        let exact = main_key(Namespace::Listener, tuple)?;
        if let Some(blob) = self.fetch_value(&exact, true).await {
            return Ok(Some(blob));
        }

        // Wildcard listeners: per position, OR together the index entries
        // of all facet variants, then intersect across positions.
        let subkeys = tuple_subkeys(Namespace::Listener, tuple)?;
        if subkeys.is_empty() {
            return Ok(None);
        }
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        let mut initialised = false;
        for group in subkeys.chunks(SUBKEY_VARIANTS_PER_POSITION) {
            let mut union: Vec<Vec<u8>> = Vec::new();
            for sk in group {
                if let Some(bytes) = self.fetch_value(sk, true).await {
                    match decode_index(&bytes) {
                        Ok(entries) => {
                            for entry in entries {
                                if !union.contains(&entry) {
                                    union.push(entry);
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "skipping unreadable listener index"),
                    }
                }
            }
            if initialised {
                candidates.retain(|c| union.contains(c));
            } else {
                candidates = union;
                initialised = true;
            }
            if candidates.is_empty() {
                return Ok(None);
            }
        }
        let pick = rand::thread_rng().gen_range(0..candidates.len());
        Ok(Some(candidates.swap_remove(pick)))
    }

    /// The main keys of tuples matching a template, via sub-key index
    /// intersection. `None` when no tuple can match.
    async fn find_tuple_keys(&self, template: &Template) -> Result<Option<Vec<Key>>> {
        if let Some(tuple) = template.as_tuple() {
            // Deterministic template: the main key is derived directly.
            return Ok(Some(vec![main_key(Namespace::Tuple, &tuple)?]));
        }
        let Some(subkeys) = template_subkeys(Namespace::Tuple, template)? else {
            return Ok(None);
        };
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        let mut initialised = false;
        for sk in &subkeys {
            // A missing index means no tuple satisfies this position.
            let Some(bytes) = self.fetch_value(sk, true).await else {
                return Ok(None);
            };
            let index = decode_index(&bytes)?;
            if initialised {
                candidates.retain(|c| index.contains(c));
            } else {
                candidates = index;
                initialised = true;
            }
            if candidates.is_empty() {
                return Ok(None);
            }
        }
        let keys: Vec<Key> = candidates
            .iter()
            .filter_map(|c| Key::from_bytes(c))
            .collect();
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(keys))
    }

    async fn find_one_tuple_key(&self, template: &Template) -> Result<Option<Key>> {
        let Some(keys) = self.find_tuple_keys(template).await? else {
            return Ok(None);
        };
        let pick = rand::thread_rng().gen_range(0..keys.len());
        Ok(Some(keys[pick]))
    }

    /// Fetch a value: local store first, then an iterative search. With
    /// `replicate` unset the search skips the cache-warming store, for
    /// values about to be consumed.
    async fn fetch_value(&self, key: &Key, replicate: bool) -> Option<Vec<u8>> {
        if let Some(bytes) = self.node.get_local(key) {
            return Some(bytes);
        }
        let outcome = if replicate {
            self.node.iterative_find_value(key).await
        } else {
            self.node.lookup_value(key).await
        };
        match outcome {
            FindOutcome::Value(found) => Some(found.value),
            FindOutcome::Contacts(_) => None,
        }
    }

    async fn add_to_inverted_indexes(&self, subkeys: &[Key], entry: &[u8]) -> Result<()> {
        for sk in subkeys {
            let mut index = match self.fetch_value(sk, true).await {
                Some(bytes) => match decode_index(&bytes) {
                    Ok(index) => index,
                    Err(e) => {
                        debug!(error = %e, "replacing unreadable inverted index");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            if !index.iter().any(|e| e.as_slice() == entry) {
                index.push(entry.to_vec());
            }
            self.node.iterative_store(sk, encode_index(&index)?).await?;
        }
        Ok(())
    }

    async fn remove_from_inverted_indexes(&self, subkeys: &[Key], entry: &[u8]) -> Result<()> {
        for sk in subkeys {
            let Some(bytes) = self.fetch_value(sk, false).await else {
                continue;
            };
            let Ok(mut index) = decode_index(&bytes) else {
                continue;
            };
            let before = index.len();
            index.retain(|e| e.as_slice() != entry);
            if index.len() == before {
                continue;
            }
            if index.is_empty() {
                self.node.iterative_delete(sk).await;
            } else {
                self.node.iterative_store(sk, encode_index(&index)?).await?;
            }
        }
        Ok(())
    }
}

fn receive_tuple(
    table: &Mutex<HashMap<Key, Waiter>>,
    ctx: RpcContext,
) -> std::result::Result<Value, RpcFault> {
    let listener_key = ctx
        .args
        .first()
        .and_then(Value::as_key)
        .ok_or_else(|| RpcFault::new("Protocol", "argument 0 must be a 20-byte key"))?;
    let bytes = ctx
        .args
        .get(1)
        .and_then(Value::as_bytes)
        .ok_or_else(|| RpcFault::new("Protocol", "argument 1 must be a byte string"))?;
    let tuple = decode_tuple(bytes).map_err(|e| RpcFault::new("Protocol", e.to_string()))?;

    let waiter = table
        .lock()
        .expect("listener table lock poisoned")
        .remove(&listener_key);
    match waiter {
        Some(Waiter::Get(tx)) => {
            let _ = tx.send(tuple);
            Ok(Value::Str(REPLY_GET.to_string()))
        }
        Some(Waiter::Read { tx }) => {
            let _ = tx.send(vec![tuple]);
            Ok(Value::Str(REPLY_READ.to_string()))
        }
        None => Ok(Value::Str(REPLY_NONE.to_string())),
    }
}

fn split_listener_blob(blob: &[u8]) -> Result<(Key, Key)> {
    if blob.len() != 2 * KEY_LEN {
        return Err(SpaceError::MalformedRecord(format!(
            "listener record must be {} bytes, got {}",
            2 * KEY_LEN,
            blob.len()
        )));
    }
    let node_id = Key::from_bytes(&blob[..KEY_LEN])
        .ok_or_else(|| SpaceError::MalformedRecord("bad listener node id".to_string()))?;
    let listener_key = Key::from_bytes(&blob[KEY_LEN..])
        .ok_or_else(|| SpaceError::MalformedRecord("bad listener key".to_string()))?;
    Ok((node_id, listener_key))
}

fn decode_index(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    codec::from_slice(bytes).map_err(|e| SpaceError::MalformedRecord(format!("inverted index: {e}")))
}

fn encode_index(index: &[Vec<u8>]) -> Result<Vec<u8>> {
    codec::to_vec(&index).map_err(|e| SpaceError::Codec(e.to_string()))
}
