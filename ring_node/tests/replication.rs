use ring_proto::hash_key;
use std::sync::Arc;
use tokio::task::JoinHandle;

use ring_node::Node;

mod common;
use common::{stabilize_ring, start_node};

async fn three_node_ring() -> Vec<(Arc<Node>, JoinHandle<()>)> {
    let mut members = Vec::new();
    for _ in 0..3 {
        members.push(start_node().await);
    }
    let bootstrap = members[0].0.address().to_string();
    for (node, _) in members.iter().skip(1) {
        node.join(bootstrap.clone()).await.expect("join failed");
    }
    let nodes: Vec<Arc<Node>> = members.iter().map(|(n, _)| n.clone()).collect();
    stabilize_ring(&nodes, 10).await;
    members
}

async fn holder_of(nodes: &[Arc<Node>], key: &str) -> Option<usize> {
    for (i, node) in nodes.iter().enumerate() {
        if node.storage.contains_local(key).await {
            return Some(i);
        }
    }
    None
}

#[tokio::test]
async fn inserts_are_replicated_to_both_successors() {
    let members = three_node_ring().await;
    let nodes: Vec<Arc<Node>> = members.iter().map(|(n, _)| n.clone()).collect();

    let key = "replication_key".to_string();
    assert!(nodes[0]
        .insert(key.clone(), b"replicated".to_vec())
        .await
        .unwrap());

    stabilize_ring(&nodes, 4).await;

    let owner_index = match holder_of(&nodes, &key).await {
        Some(i) => i,
        None => panic!("no node holds key '{}' (id {})", key, hash_key(&key)),
    };
    let owner = nodes[owner_index].clone();

    // With three nodes and R = 3 the other two each hold a replica.
    for node in nodes.iter().filter(|n| n.id() != owner.id()) {
        assert_eq!(
            node.storage.replica_value(owner.id(), &key).await.unwrap(),
            b"replicated",
            "node {} is missing its replica",
            node.id()
        );
    }
    assert!(owner.storage.shortfall(&key).await.is_none());
}

#[tokio::test]
async fn owner_failure_promotes_replicas_to_the_successor() {
    let members = three_node_ring().await;
    let nodes: Vec<Arc<Node>> = members.iter().map(|(n, _)| n.clone()).collect();

    let key = "promoted_key".to_string();
    assert!(nodes[0]
        .insert(key.clone(), b"survives".to_vec())
        .await
        .unwrap());
    stabilize_ring(&nodes, 4).await;

    let owner_index = holder_of(&nodes, &key).await.expect("key stored nowhere");

    // Kill the owner and let the survivors notice.
    members[owner_index].1.abort();
    let survivors: Vec<Arc<Node>> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != owner_index)
        .map(|(_, n)| n.clone())
        .collect();
    stabilize_ring(&survivors, 10).await;

    // The dead node is gone from every routing structure.
    let dead = nodes[owner_index].id();
    for node in &survivors {
        assert_ne!(node.fingers.successor().id, dead);
        assert!(node.fingers.predecessor().map(|p| p.id) != Some(dead));
        assert!(!node.fingers.successor_list().iter().any(|s| s.id == dead));
    }

    // Exactly one survivor promoted the replica into its own store, and
    // the value is reachable from both.
    let mut holders = 0;
    for node in &survivors {
        if node.storage.contains_local(&key).await {
            holders += 1;
        }
    }
    assert_eq!(holders, 1);
    for node in &survivors {
        assert_eq!(
            node.get(key.clone()).await.unwrap().unwrap(),
            b"survives",
            "node {} cannot read the promoted key",
            node.id()
        );
    }
}
