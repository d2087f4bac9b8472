//! The iterative lookup engine.
//!
//! One [`IterativeLookup`] drives a single FIND_NODE, FIND_VALUE or DELETE
//! operation to completion. The engine is loosely parallel in Kademlia's
//! sense: at most alpha probes are in flight at once, a new iteration runs
//! either when the iteration delay elapses or as soon as the last
//! in-flight probe returns, and progress is measured by improvement in the
//! closest known contact rather than by wall-clock time.
//!
//! Per-invocation state lives in an explicit struct owned by the calling
//! task; probe replies are folded in as they arrive at the loop.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use weft_transport::rpc::RawResponse;
use weft_transport::wire::Value;
use weft_types::{Contact, Key};

use crate::node::NodeInner;
use crate::DhtError;

/// Which RPC an iterative lookup dispatches at each probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LookupRpc {
    FindNode,
    FindValue,
    Delete,
}

impl LookupRpc {
    fn method(self) -> &'static str {
        match self {
            LookupRpc::FindNode => "find_node",
            LookupRpc::FindValue => "find_value",
            LookupRpc::Delete => "delete",
        }
    }
}

/// A value located by an iterative FIND_VALUE.
#[derive(Clone, Debug)]
pub struct FoundValue {
    /// The located value bytes.
    pub value: Vec<u8>,
    /// The closest contact seen that did *not* hold the value; the caller
    /// may push the value there to warm the cache at the frontier.
    pub closest_node_no_value: Option<Contact>,
}

/// The result of an iterative lookup: either the located value, or the k
/// closest reachable contacts found.
#[derive(Clone, Debug)]
pub enum FindOutcome {
    /// FIND_VALUE located the value.
    Value(FoundValue),
    /// The k closest reachable contacts, sorted by distance to the target.
    Contacts(Vec<Contact>),
}

impl FindOutcome {
    /// The contact list, or empty when a value was found instead.
    pub fn into_contacts(self) -> Vec<Contact> {
        match self {
            FindOutcome::Contacts(contacts) => contacts,
            FindOutcome::Value(_) => Vec::new(),
        }
    }

    /// The located value, if any.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            FindOutcome::Value(found) => Some(&found.value),
            FindOutcome::Contacts(_) => None,
        }
    }
}

type ProbeFuture = BoxFuture<'static, (Contact, crate::Result<RawResponse>)>;

/// Per-invocation state of one iterative lookup.
pub(crate) struct IterativeLookup {
    node: Arc<NodeInner>,
    key: Key,
    rpc: LookupRpc,
    /// Candidate contacts, not yet verified.
    shortlist: Vec<Contact>,
    /// Ids already probed (or synthesised ids already rewritten).
    already_contacted: HashSet<Key>,
    /// Contacts that replied successfully, kept sorted by distance.
    active_contacts: Vec<Contact>,
    /// The best contact of the previous iteration; an unchanged best with
    /// no probes in flight means convergence.
    prev_closest: Option<Key>,
    found_value: Option<Vec<u8>>,
    closest_node_no_value: Option<Contact>,
}

impl IterativeLookup {
    /// Prepare a lookup. Without a bootstrap shortlist the alpha closest
    /// known contacts seed the search and the target's bucket is touched.
    pub(crate) fn new(
        node: Arc<NodeInner>,
        key: Key,
        rpc: LookupRpc,
        bootstrap: Option<Vec<Contact>>,
    ) -> Self {
        let shortlist = match bootstrap {
            Some(contacts) => contacts,
            None => {
                let mut routing = node.routing.lock().expect("routing table lock poisoned");
                let seeds = routing.find_close_nodes(&key, node.config.alpha, None);
                if key != node.id {
                    routing.touch_bucket(&key);
                }
                seeds
            }
        };
        Self {
            node,
            key,
            rpc,
            shortlist,
            already_contacted: HashSet::new(),
            active_contacts: Vec::new(),
            prev_closest: None,
            found_value: None,
            closest_node_no_value: None,
        }
    }

    /// Drive the lookup to completion.
    pub(crate) async fn run(mut self) -> FindOutcome {
        let k = self.node.config.k;
        let alpha = self.node.config.alpha;
        let delay = self.node.config.lookup_delay();

        if self.shortlist.is_empty() {
            // This node knows of no peers at all.
            return FindOutcome::Contacts(Vec::new());
        }

        let mut probes: FuturesUnordered<ProbeFuture> = FuturesUnordered::new();

        loop {
            let key = self.key;
            self.active_contacts.sort_by_key(|c| c.id.distance(&key));
            self.shortlist.sort_by_key(|c| c.id.distance(&key));

            if let Some(value) = self.found_value.take() {
                return FindOutcome::Value(FoundValue {
                    value,
                    closest_node_no_value: self.closest_node_no_value.take(),
                });
            }

            if !self.active_contacts.is_empty() && self.rpc != LookupRpc::FindValue {
                let best_unchanged =
                    self.active_contacts.first().map(|c| c.id) == self.prev_closest;
                // Convergence needs more than an unchanged best: none of
                // the k closest candidates may still be awaiting a probe,
                // otherwise a short first round could resolve with fewer
                // than k reachable contacts.
                let unprobed_near = self
                    .shortlist
                    .iter()
                    .take(k)
                    .any(|c| !self.already_contacted.contains(&c.id));
                if self.active_contacts.len() >= k
                    || (best_unchanged && probes.is_empty() && !unprobed_near)
                {
                    self.active_contacts.truncate(k);
                    return FindOutcome::Contacts(self.active_contacts);
                }
            }

            if let Some(best) = self.active_contacts.first() {
                self.prev_closest = Some(best.id);
            }

            // Launch up to alpha probes at the closest uncontacted candidates.
            let mut launched = 0usize;
            for contact in self.shortlist.clone() {
                if launched == alpha {
                    break;
                }
                if self.already_contacted.contains(&contact.id) {
                    continue;
                }
                self.already_contacted.insert(contact.id);
                probes.push(probe(
                    Arc::clone(&self.node),
                    self.rpc,
                    self.key,
                    contact,
                ));
                launched += 1;
            }

            if probes.is_empty() {
                // Nothing in flight and nobody left to ask: no further
                // improvement is possible.
                self.active_contacts.truncate(k);
                return FindOutcome::Contacts(self.active_contacts);
            }

            // Wait for the iteration tick, folding in probe replies as they
            // arrive; re-enter immediately when the last probe lands.
            let tick = tokio::time::sleep(delay);
            tokio::pin!(tick);
            loop {
                tokio::select! {
                    _ = &mut tick => break,
                    outcome = probes.next() => match outcome {
                        Some((probed, result)) => {
                            self.handle_probe_outcome(probed, result);
                            if probes.is_empty() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_probe_outcome(&mut self, probed: Contact, result: crate::Result<RawResponse>) {
        match result {
            Ok(raw) => self.extend_shortlist(raw),
            Err(DhtError::Timeout { node_id }) => {
                // The contact is dead for this cycle; prune it so it is not
                // re-probed. The routing table eviction already happened in
                // the call path.
                self.shortlist
                    .retain(|c| c.id != node_id && c.id != probed.id);
            }
            Err(e) => {
                debug!(peer = %probed, error = %e, "lookup probe failed");
            }
        }
    }

    /// Fold a successful probe reply into the lookup state.
    fn extend_shortlist(&mut self, raw: RawResponse) {
        let sender = raw.sender;
        if sender == self.node.id || self.active_contacts.iter().any(|c| c.id == sender) {
            return;
        }

        // Rebuild the contact from the address the reply actually came
        // from; this rewrites synthesised bootstrap ids with real ones.
        let contact = Contact::new(sender, raw.source);
        self.active_contacts.push(contact.clone());
        self.already_contacted.insert(sender);

        if self.rpc == LookupRpc::FindValue {
            if let Some(map) = raw.result.as_map() {
                if let Some(value) = map.get(self.key.as_bytes().as_slice()) {
                    if let Some(bytes) = value.as_bytes() {
                        self.found_value = Some(bytes.to_vec());
                        return;
                    }
                }
            }
            // The remote had no value; remember the closest empty contact
            // as the cache-warming target.
            let better = match &self.closest_node_no_value {
                Some(current) => {
                    sender.distance(&self.key) < current.id.distance(&self.key)
                }
                None => true,
            };
            if better {
                self.closest_node_no_value = Some(contact);
            }
        }

        if let Some(triples) = raw.result.as_list() {
            for triple in triples {
                let Some(candidate) = contact_from_triple(triple) else {
                    debug!("skipping malformed contact triple");
                    continue;
                };
                if candidate.id == self.node.id {
                    continue;
                }
                if !self.shortlist.iter().any(|c| c.id == candidate.id) {
                    self.shortlist.push(candidate);
                }
            }
        }
    }
}

fn probe(node: Arc<NodeInner>, rpc: LookupRpc, key: Key, contact: Contact) -> ProbeFuture {
    Box::pin(async move {
        let result = node
            .call_contact(&contact, rpc.method(), vec![Value::key(&key)])
            .await;
        (contact, result)
    })
}

/// Decode one `(id, ip, port)` triple from a FIND_NODE-style reply.
fn contact_from_triple(value: &Value) -> Option<Contact> {
    let items = value.as_list()?;
    if items.len() != 3 {
        return None;
    }
    let id = items[0].as_key()?;
    let ip: std::net::IpAddr = items[1].as_str()?.parse().ok()?;
    let port = u16::try_from(items[2].as_int()?).ok()?;
    Some(Contact::new(id, std::net::SocketAddr::new(ip, port)))
}
