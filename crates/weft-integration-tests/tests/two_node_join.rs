//! Integration test: two-node join and basic iterative operations.
//!
//! Exercises the bootstrap path end to end:
//! 1. Node A binds; node B joins with A as its only bootstrap address
//! 2. Both routing tables end up holding the peer's *real* id (bootstrap
//!    contacts start with synthesised ids that are rewritten on first reply)
//! 3. Values stored through one node are found through the other
//! 4. DELETE removes every copy

use std::time::Duration;

use weft_integration_tests::{bind_node, init_tracing, shutdown_all, spawn_network, test_config};
use weft_kademlia::{FindOutcome, Node};
use weft_types::Key;

#[tokio::test]
async fn two_node_join_exchanges_real_ids() {
    init_tracing();
    let a = bind_node().await;
    let b = bind_node().await;
    let a_addr = a.local_addr().expect("addr");

    let found = b.join(&[a_addr]).await;

    // The join's self-lookup reaches A; within two lookup delays each
    // table holds the peer under its real id.
    tokio::time::sleep(2 * test_config().lookup_delay()).await;

    assert!(
        found.iter().any(|c| c.id == a.id()),
        "join should discover A's real id"
    );
    assert_eq!(b.known_contact(&a.id()).map(|c| c.id), Some(a.id()));
    assert_eq!(a.known_contact(&b.id()).map(|c| c.id), Some(b.id()));
    assert_eq!(a.contact_count(), 1);
    assert_eq!(b.contact_count(), 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn iterative_find_node_returns_k_closest_sorted() {
    init_tracing();
    // k + 3 reachable nodes.
    let nodes = spawn_network(11).await;
    let k = test_config().k;
    let target = Key::generate();

    let found = nodes[1].iterative_find_node(&target).await;

    assert_eq!(found.len(), k, "lookup should return exactly k contacts");
    for pair in found.windows(2) {
        assert!(
            pair[0].id.distance(&target) <= pair[1].id.distance(&target),
            "results must be sorted by distance"
        );
    }
    // Every returned contact is a real node of the network.
    let real_ids: Vec<Key> = nodes.iter().map(Node::id).collect();
    assert!(found.iter().all(|c| real_ids.contains(&c.id)));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn store_and_find_value_across_the_network() {
    init_tracing();
    let nodes = spawn_network(5).await;
    let key = Key::for_content(b"greeting");

    nodes[1]
        .iterative_store(&key, b"hello weft".to_vec())
        .await
        .expect("store");
    // STORE RPCs are fire-and-forget; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = nodes[4].iterative_find_value(&key).await;
    assert_eq!(
        outcome.value(),
        Some(b"hello weft".as_slice()),
        "a stored value must be findable from any node"
    );

    // An absent key yields contacts, not an error.
    let absent = nodes[4].iterative_find_value(&Key::for_content(b"nothing")).await;
    assert!(matches!(absent, FindOutcome::Contacts(_)));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn iterative_delete_removes_all_copies() {
    init_tracing();
    let nodes = spawn_network(4).await;
    let key = Key::for_content(b"short-lived");

    nodes[0]
        .iterative_store(&key, b"data".to_vec())
        .await
        .expect("store");
    tokio::time::sleep(Duration::from_millis(300)).await;

    nodes[2].iterative_delete(&key).await;
    // The delete lookup awaits its probes, so remote copies are gone.
    for node in &nodes {
        assert!(
            !node.contains_local(&key),
            "node {} still holds the deleted key",
            node.id()
        );
    }
    let outcome = nodes[3].iterative_find_value(&key).await;
    assert!(matches!(outcome, FindOutcome::Contacts(_)));

    shutdown_all(&nodes);
}
