//! Shared helpers for the Weft integration tests.
//!
//! The tests run real nodes over loopback UDP with timeouts shrunk to
//! keep the suite fast: lookups iterate every 100 ms and RPCs time out
//! after one second.

use weft_kademlia::{Node, NodeConfig};
use weft_space::TupleSpacePeer;

/// A node configuration suitable for loopback testing.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1".to_string(),
        rpc_timeout_ms: 1_000,
        iterative_lookup_delay_ms: Some(100),
        ..Default::default()
    }
}

/// Initialise tracing from `RUST_LOG`, once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Bind a node with the test configuration.
pub async fn bind_node() -> Node {
    Node::bind(test_config()).await.expect("bind node")
}

/// Bind `count` nodes and join them into one network through the first.
pub async fn spawn_network(count: usize) -> Vec<Node> {
    assert!(count >= 1);
    let mut nodes = vec![bind_node().await];
    let seed = nodes[0].local_addr().expect("seed addr");
    for _ in 1..count {
        let node = bind_node().await;
        node.join(&[seed]).await;
        nodes.push(node);
    }
    // The seed joins last, seeding from the contacts it has observed.
    nodes[0].join(&[]).await;
    nodes
}

/// Wrap every node of a fresh network in a tuple-space peer.
pub async fn spawn_space_network(count: usize) -> Vec<TupleSpacePeer> {
    spawn_network(count)
        .await
        .into_iter()
        .map(TupleSpacePeer::new)
        .collect()
}

/// Shut down every node in a network.
pub fn shutdown_all(nodes: &[Node]) {
    for node in nodes {
        node.shutdown();
    }
}
