//! The Kademlia node.
//!
//! A [`Node`] composes the RPC endpoint, a routing table, a data store and
//! its own 160-bit id. It answers the five base RPCs (`ping`, `store`,
//! `find_node`, `find_value`, `delete`), drives iterative operations
//! through the lookup engine, and runs the periodic bucket-refresh and
//! republish cycle once it has joined a network.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use weft_transport::rpc::{Handler, HandlerFuture, RawResponse, RpcContext, RpcEndpoint, RpcFault};
use weft_transport::wire::Value;
use weft_transport::TransportError;
use weft_types::contact::unix_now;
use weft_types::{Contact, Key};

use crate::config::NodeConfig;
use crate::lookup::{FindOutcome, IterativeLookup, LookupRpc};
use crate::routing::{AddOutcome, RoutingTable, TreeRoutingTable};
use crate::store::{DataStore, MemoryStore};
use crate::{DhtError, Result};

/// A running DHT node. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) id: Key,
    pub(crate) config: NodeConfig,
    pub(crate) endpoint: Arc<RpcEndpoint>,
    pub(crate) routing: Mutex<Box<dyn RoutingTable>>,
    pub(crate) store: Mutex<Box<dyn DataStore>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    maintenance_started: AtomicBool,
}

impl Node {
    /// Bind a node with the default in-memory store and tree routing table.
    pub async fn bind(config: NodeConfig) -> Result<Node> {
        Self::with_parts(config, None, None).await
    }

    /// Bind a node with injected storage and/or routing implementations.
    ///
    /// When a routing table is supplied, its local id becomes the node id;
    /// otherwise a fresh id is generated.
    pub async fn with_parts(
        config: NodeConfig,
        data_store: Option<Box<dyn DataStore>>,
        routing_table: Option<Box<dyn RoutingTable>>,
    ) -> Result<Node> {
        config.validate()?;

        let (id, routing): (Key, Box<dyn RoutingTable>) = match routing_table {
            Some(table) => (table.local_id(), table),
            None => {
                let id = Key::generate();
                (id, Box::new(TreeRoutingTable::new(id, config.k)))
            }
        };
        let store = data_store.unwrap_or_else(|| Box::new(MemoryStore::new()));

        let endpoint = RpcEndpoint::bind(id, config.bind_addr()?, config.rpc_timeout())
            .await
            .map_err(DhtError::from)?;

        let inner = Arc::new(NodeInner {
            id,
            config,
            endpoint,
            routing: Mutex::new(routing),
            store: Mutex::new(store),
            tasks: Mutex::new(Vec::new()),
            maintenance_started: AtomicBool::new(false),
        });

        NodeInner::register_handlers(&inner);

        let weak = Arc::downgrade(&inner);
        inner.endpoint.set_observer(Box::new(move |sender, addr| {
            if let Some(inner) = weak.upgrade() {
                inner.observe_sender(sender, addr);
            }
        }));

        let handle = inner.endpoint.start();
        inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .push(handle);

        info!(id = %inner.id, addr = ?inner.endpoint.local_addr().ok(), "node bound");
        Ok(Node { inner })
    }

    /// This node's id.
    pub fn id(&self) -> Key {
        self.inner.id
    }

    /// This node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.endpoint.local_addr().map_err(DhtError::from)
    }

    /// Join the network through the given bootstrap addresses, then start
    /// the periodic refresh/republish cycle.
    ///
    /// Bootstrap contacts are synthesised with random ids; their real ids
    /// are learned from the first replies. With no bootstrap addresses the
    /// search seeds from the local routing table (useful for the first
    /// node of a network).
    pub async fn join(&self, bootstrap: &[SocketAddr]) -> Vec<Contact> {
        let shortlist = if bootstrap.is_empty() {
            None
        } else {
            Some(
                bootstrap
                    .iter()
                    .map(|addr| Contact::new(Key::generate(), *addr))
                    .collect(),
            )
        };
        let found = IterativeLookup::new(
            Arc::clone(&self.inner),
            self.inner.id,
            LookupRpc::FindNode,
            shortlist,
        )
        .run()
        .await
        .into_contacts();

        info!(id = %self.inner.id, peers = found.len(), "joined network");
        self.spawn_maintenance();
        found
    }

    /// The basic Kademlia node lookup: the k closest reachable contacts.
    pub async fn iterative_find_node(&self, key: &Key) -> Vec<Contact> {
        IterativeLookup::new(Arc::clone(&self.inner), *key, LookupRpc::FindNode, None)
            .run()
            .await
            .into_contacts()
    }

    /// The Kademlia search operation. On success the value is also pushed
    /// to the closest contact seen without it, warming the cache at the
    /// frontier.
    pub async fn iterative_find_value(&self, key: &Key) -> FindOutcome {
        let outcome = self.lookup_value(key).await;
        if let FindOutcome::Value(found) = &outcome {
            if let Some(target) = &found.closest_node_no_value {
                let inner = Arc::clone(&self.inner);
                let target = target.clone();
                let key = *key;
                let value = found.value.clone();
                tokio::spawn(async move {
                    let args = vec![Value::key(&key), Value::Bytes(value)];
                    if let Err(e) = inner.call_contact(&target, "store", args).await {
                        debug!(peer = %target, error = %e, "cache-warming store failed");
                    }
                });
            }
        }
        outcome
    }

    /// A FIND_VALUE search without the cache-warming store, for callers
    /// that must not replicate the value they are about to consume.
    pub async fn lookup_value(&self, key: &Key) -> FindOutcome {
        IterativeLookup::new(Arc::clone(&self.inner), *key, LookupRpc::FindValue, None)
            .run()
            .await
    }

    /// Publish a value under a key, as this node.
    pub async fn iterative_store(&self, key: &Key, value: Vec<u8>) -> Result<Vec<Contact>> {
        self.inner
            .do_iterative_store(*key, value, self.inner.id, 0)
            .await
    }

    /// Re-push a value on behalf of its original publisher, preserving the
    /// item's age.
    pub async fn iterative_store_as(
        &self,
        key: &Key,
        value: Vec<u8>,
        publisher: Key,
        age: u64,
    ) -> Result<Vec<Contact>> {
        self.inner
            .do_iterative_store(*key, value, publisher, age)
            .await
    }

    /// Remove a key from the DHT: drop the local copy, then dispatch
    /// DELETE to the k closest nodes via the lookup engine.
    pub async fn iterative_delete(&self, key: &Key) -> Vec<Contact> {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .delete(key);
        IterativeLookup::new(Arc::clone(&self.inner), *key, LookupRpc::Delete, None)
            .run()
            .await
            .into_contacts()
    }

    /// Issue a raw RPC to a specific contact. Used by overlays for their
    /// own methods (e.g. direct tuple delivery).
    pub async fn call(
        &self,
        contact: &Contact,
        method: &str,
        args: Vec<Value>,
    ) -> Result<RawResponse> {
        self.inner.call_contact(contact, method, args).await
    }

    /// Expose an additional RPC method on this node.
    pub fn register_handler(&self, method: &str, handler: Handler) {
        self.inner.endpoint.register_handler(method, handler);
    }

    /// Store an item locally without touching the network.
    pub fn store_local(
        &self,
        key: &Key,
        value: Vec<u8>,
        publisher: Option<Key>,
        age: u64,
    ) -> Result<()> {
        self.inner.store_local(*key, value, publisher, age)
    }

    /// The locally stored value for a key, if any.
    pub fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .get(key)
    }

    /// Whether a key is stored locally.
    pub fn contains_local(&self, key: &Key) -> bool {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .contains(key)
    }

    /// Drop the local copy of a key.
    pub fn delete_local(&self, key: &Key) -> bool {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .delete(key)
    }

    /// The original publisher of a locally stored item.
    pub fn local_item_publisher(&self, key: &Key) -> Option<Key> {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .original_publisher(key)
    }

    /// The original publish time of a locally stored item.
    pub fn local_item_publish_time(&self, key: &Key) -> Option<u64> {
        self.inner
            .store
            .lock()
            .expect("data store lock poisoned")
            .original_publish_time(key)
    }

    /// A contact from the routing table, by id.
    pub fn known_contact(&self, id: &Key) -> Option<Contact> {
        self.inner
            .routing
            .lock()
            .expect("routing table lock poisoned")
            .get_contact(id)
    }

    /// Offer a contact to the routing table directly.
    pub fn add_contact(&self, contact: Contact) {
        self.inner.observe_contact(contact);
    }

    /// Number of contacts currently known.
    pub fn contact_count(&self) -> usize {
        self.inner
            .routing
            .lock()
            .expect("routing table lock poisoned")
            .contact_count()
    }

    /// Run one refresh/republish cycle immediately (normally driven by the
    /// maintenance timer).
    pub async fn refresh_now(&self) {
        self.inner.refresh_cycle().await;
    }

    /// Stop the receive loop and all maintenance tasks.
    pub fn shutdown(&self) {
        for task in self
            .inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }

    fn spawn_maintenance(&self) {
        if self
            .inner
            .maintenance_started
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let interval = self.inner.config.check_refresh_interval();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                inner.refresh_cycle().await;
            }
        });
        self.inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .push(handle);
    }
}

impl NodeInner {
    /// Install the base RPC handlers in the endpoint's dispatch table.
    fn register_handlers(inner: &Arc<NodeInner>) {
        fn with_node(
            inner: &Arc<NodeInner>,
            f: fn(Arc<NodeInner>, RpcContext) -> std::result::Result<Value, RpcFault>,
        ) -> Handler {
            let weak = Arc::downgrade(inner);
            Arc::new(move |ctx: RpcContext| -> HandlerFuture {
                let weak: Weak<NodeInner> = weak.clone();
                Box::pin(async move {
                    let node = weak
                        .upgrade()
                        .ok_or_else(|| RpcFault::new("Internal", "node is shutting down"))?;
                    f(node, ctx)
                })
            })
        }

        inner
            .endpoint
            .register_handler("ping", with_node(inner, |_node, _ctx| {
                Ok(Value::Str("pong".to_string()))
            }));
        inner
            .endpoint
            .register_handler("store", with_node(inner, |node, ctx| node.rpc_store(ctx)));
        inner.endpoint.register_handler(
            "find_node",
            with_node(inner, |node, ctx| node.rpc_find_node(ctx)),
        );
        inner.endpoint.register_handler(
            "find_value",
            with_node(inner, |node, ctx| node.rpc_find_value(ctx)),
        );
        inner
            .endpoint
            .register_handler("delete", with_node(inner, |node, ctx| node.rpc_delete(ctx)));
    }

    /// Every inbound datagram refreshes the sender's entry in the routing
    /// table.
    fn observe_sender(self: &Arc<Self>, sender: Key, addr: SocketAddr) {
        if sender == self.id {
            return;
        }
        self.observe_contact_inner(Contact::new(sender, addr));
    }

    fn observe_contact(self: &Arc<Self>, contact: Contact) {
        if contact.id == self.id {
            return;
        }
        self.observe_contact_inner(contact);
    }

    fn observe_contact_inner(self: &Arc<Self>, contact: Contact) {
        let outcome = self
            .routing
            .lock()
            .expect("routing table lock poisoned")
            .add_contact(contact.clone());
        if let AddOutcome::Full { head } = outcome {
            // Replacement probe: ping the least-recently-seen contact and
            // keep whichever of the two proves alive.
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.replacement_probe(head, contact).await;
            });
        }
    }

    async fn replacement_probe(self: Arc<Self>, head: Contact, newcomer: Contact) {
        debug!(head = %head, "bucket full; probing least-recently-seen contact");
        match self
            .endpoint
            .call(&head.id, head.addr, "ping", Vec::new())
            .await
        {
            Ok(_) => {
                self.routing
                    .lock()
                    .expect("routing table lock poisoned")
                    .promote(&head.id);
            }
            Err(TransportError::Timeout { .. }) => {
                debug!(head = %head, newcomer = %newcomer, "head timed out; replacing");
                self.routing
                    .lock()
                    .expect("routing table lock poisoned")
                    .replace(&head.id, newcomer);
            }
            Err(e) => debug!(head = %head, error = %e, "replacement probe failed"),
        }
    }

    /// Issue an outbound RPC; a timeout evicts the contact from the
    /// routing table before surfacing to the caller.
    pub(crate) async fn call_contact(
        &self,
        contact: &Contact,
        method: &str,
        args: Vec<Value>,
    ) -> Result<RawResponse> {
        match self.endpoint.call(&contact.id, contact.addr, method, args).await {
            Ok(raw) => Ok(raw),
            Err(TransportError::Timeout { node_id }) => {
                self.routing
                    .lock()
                    .expect("routing table lock poisoned")
                    .remove_contact(&node_id);
                Err(DhtError::Timeout { node_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn store_local(
        &self,
        key: Key,
        value: Vec<u8>,
        publisher: Option<Key>,
        age: u64,
    ) -> Result<()> {
        let publisher = publisher.ok_or(DhtError::MissingPublisher)?;
        let now = unix_now();
        self.store
            .lock()
            .expect("data store lock poisoned")
            .set(key, value, now, now.saturating_sub(age), publisher)
    }

    pub(crate) async fn do_iterative_store(
        self: &Arc<Self>,
        key: Key,
        value: Vec<u8>,
        publisher: Key,
        age: u64,
    ) -> Result<Vec<Contact>> {
        // The publisher keeps its own copy; replication refreshes remote
        // items in place with their metadata preserved.
        self.store_local(key, value.clone(), Some(publisher), age)?;

        let contacts = IterativeLookup::new(Arc::clone(self), key, LookupRpc::FindNode, None)
            .run()
            .await
            .into_contacts();

        // STORE RPCs are fire-and-forget: completion is not awaited.
        for contact in &contacts {
            let inner = Arc::clone(self);
            let contact = contact.clone();
            let value = value.clone();
            tokio::spawn(async move {
                let args = vec![
                    Value::key(&key),
                    Value::Bytes(value),
                    Value::Bytes(publisher.to_vec()),
                    Value::Int(i64::try_from(age).unwrap_or(i64::MAX)),
                ];
                if let Err(e) = inner.call_contact(&contact, "store", args).await {
                    debug!(peer = %contact, error = %e, "store rpc failed");
                }
            });
        }
        Ok(contacts)
    }

    /// One maintenance pass: refresh idle buckets, then republish,
    /// replicate and expire stored items.
    pub(crate) async fn refresh_cycle(self: &Arc<Self>) {
        let stale = self
            .routing
            .lock()
            .expect("routing table lock poisoned")
            .stale_buckets(self.config.refresh_timeout(), false);
        for index in stale {
            let target = self
                .routing
                .lock()
                .expect("routing table lock poisoned")
                .random_key_in_bucket(index);
            if let Some(target) = target {
                debug!(bucket = index, "refreshing bucket");
                let _ = IterativeLookup::new(Arc::clone(self), target, LookupRpc::FindNode, None)
                    .run()
                    .await;
            }
        }
        self.republish().await;
    }

    async fn republish(self: &Arc<Self>) {
        let now = unix_now();
        let keys = self
            .store
            .lock()
            .expect("data store lock poisoned")
            .keys();
        for key in keys {
            let snapshot = {
                let store = self.store.lock().expect("data store lock poisoned");
                match (
                    store.get(&key),
                    store.original_publisher(&key),
                    store.original_publish_time(&key),
                    store.last_published(&key),
                ) {
                    (Some(value), Some(publisher), Some(published), Some(last)) => {
                        Some((value, publisher, published, last))
                    }
                    _ => None,
                }
            };
            let Some((value, publisher, originally_published, last_published)) = snapshot else {
                continue;
            };
            let age = now.saturating_sub(originally_published);

            if publisher == self.id {
                // Original publisher: republish before the data expires.
                if age.saturating_mul(1000) >= self.config.data_expire_timeout_ms {
                    debug!(key = %key, "republishing own item");
                    let _ = self.do_iterative_store(key, value, self.id, 0).await;
                }
            } else if age.saturating_mul(1000) >= self.config.data_expire_timeout_ms {
                // A replica is not refreshed past its lifetime.
                debug!(key = %key, "expiring replicated item");
                self.store
                    .lock()
                    .expect("data store lock poisoned")
                    .delete(&key);
            } else if now
                .saturating_sub(last_published)
                .saturating_mul(1000)
                >= self.config.replicate_interval_ms
            {
                // Replicate at intervals without changing the metadata.
                debug!(key = %key, "replicating item");
                let _ = self.do_iterative_store(key, value, publisher, age).await;
            }
        }
    }

    // === RPC handlers ===

    fn rpc_store(self: Arc<Self>, ctx: RpcContext) -> std::result::Result<Value, RpcFault> {
        let key = arg_key(&ctx.args, 0)?;
        let value = arg_bytes(&ctx.args, 1)?;
        let publisher = match ctx.args.get(2) {
            Some(arg) => Some(arg.as_key().ok_or_else(|| {
                RpcFault::new("Protocol", "publisher must be a 20-byte id")
            })?),
            None => None,
        };
        let age = match ctx.args.get(3) {
            Some(arg) => arg
                .as_int()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| RpcFault::new("Protocol", "age must be a non-negative integer"))?,
            None => 0,
        };
        // A store needs a publisher: the explicit argument, else the RPC
        // sender itself.
        let publisher = publisher.or(Some(ctx.sender));
        self.store_local(key, value, publisher, age)
            .map_err(|e| e.to_fault())?;
        Ok(Value::Str("OK".to_string()))
    }

    fn rpc_find_node(self: Arc<Self>, ctx: RpcContext) -> std::result::Result<Value, RpcFault> {
        let key = arg_key(&ctx.args, 0)?;
        Ok(self.closest_triples(&key, Some(&ctx.sender)))
    }

    fn rpc_find_value(self: Arc<Self>, ctx: RpcContext) -> std::result::Result<Value, RpcFault> {
        let key = arg_key(&ctx.args, 0)?;
        let local = self
            .store
            .lock()
            .expect("data store lock poisoned")
            .get(&key);
        match local {
            Some(value) => {
                let map = BTreeMap::from([(key.to_vec(), Value::Bytes(value))]);
                Ok(Value::Map(map))
            }
            None => Ok(self.closest_triples(&key, Some(&ctx.sender))),
        }
    }

    fn rpc_delete(self: Arc<Self>, ctx: RpcContext) -> std::result::Result<Value, RpcFault> {
        let key = arg_key(&ctx.args, 0)?;
        self.store
            .lock()
            .expect("data store lock poisoned")
            .delete(&key);
        // Propagates through the network like a FIND_NODE for the key.
        Ok(self.closest_triples(&key, Some(&ctx.sender)))
    }

    /// The k closest known contacts to `key` as wire triples.
    fn closest_triples(&self, key: &Key, exclude: Option<&Key>) -> Value {
        let contacts = self
            .routing
            .lock()
            .expect("routing table lock poisoned")
            .find_close_nodes(key, self.config.k, exclude);
        Value::List(
            contacts
                .iter()
                .map(|c| {
                    Value::List(vec![
                        Value::key(&c.id),
                        Value::Str(c.addr.ip().to_string()),
                        Value::Int(i64::from(c.addr.port())),
                    ])
                })
                .collect(),
        )
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn arg_key(args: &[Value], index: usize) -> std::result::Result<Key, RpcFault> {
    args.get(index).and_then(Value::as_key).ok_or_else(|| {
        RpcFault::new(
            "Protocol",
            format!("argument {index} must be a 20-byte key"),
        )
    })
}

fn arg_bytes(args: &[Value], index: usize) -> std::result::Result<Vec<u8>, RpcFault> {
    args.get(index)
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            RpcFault::new(
                "Protocol",
                format!("argument {index} must be a byte string"),
            )
        })
}
