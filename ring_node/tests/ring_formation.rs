use ring_node::constants::REPLICATION_COUNT;

mod common;
use common::{key_owned_by, stabilize_ring, start_node};

#[tokio::test]
async fn two_nodes_point_at_each_other() {
    let (a, _server_a) = start_node().await;
    let (b, _server_b) = start_node().await;

    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 6).await;

    assert_eq!(a.fingers.successor().id, b.id());
    assert_eq!(b.fingers.successor().id, a.id());
    assert_eq!(a.fingers.predecessor().unwrap().id, b.id());
    assert_eq!(b.fingers.predecessor().unwrap().id, a.id());
}

#[tokio::test]
async fn keys_land_at_their_owner_and_round_trip() {
    let (a, _server_a) = start_node().await;
    let (b, _server_b) = start_node().await;

    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 6).await;

    // A key in (a, b] belongs to b no matter which node takes the call.
    let key = key_owned_by(a.id(), b.id());
    assert!(a.insert(key.clone(), b"payload".to_vec()).await.unwrap());
    assert!(b.storage.contains_local(&key).await);
    assert!(!a.storage.contains_local(&key).await);

    assert_eq!(a.get(key.clone()).await.unwrap().unwrap(), b"payload");
    assert_eq!(b.get(key.clone()).await.unwrap().unwrap(), b"payload");

    // insert; delete; get comes back absent.
    assert!(b.delete(key.clone()).await.unwrap());
    assert_eq!(a.get(key.clone()).await.unwrap(), None);
    assert!(a.ops.is_idle());
    assert!(b.ops.is_idle());
}

#[tokio::test]
async fn wrap_arc_belongs_to_the_lowest_node() {
    let (a, _server_a) = start_node().await;
    let (b, _server_b) = start_node().await;

    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 6).await;

    let (low, high) = if a.id() < b.id() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    };

    // Ids just past the highest node wrap around to the lowest one.
    let wrapped = high.id().wrapping_add(1);
    assert_eq!(high.lookup(wrapped).await.unwrap().id, low.id());
    assert_eq!(low.lookup(wrapped).await.unwrap().id, low.id());
}

#[tokio::test]
async fn single_node_serves_locally_and_records_shortfall() {
    let (a, _server_a) = start_node().await;

    assert!(a.insert("solo".into(), b"v".to_vec()).await.unwrap());
    assert_eq!(a.get("solo".into()).await.unwrap().unwrap(), b"v");

    // Alone there is nowhere to replicate: every replica is missing.
    assert_eq!(a.storage.shortfall("solo").await, Some(REPLICATION_COUNT - 1));

    assert!(a.delete("solo".into()).await.unwrap());
    assert_eq!(a.get("solo".into()).await.unwrap(), None);
    assert!(a.storage.shortfall("solo").await.is_none());
    assert!(a.ops.is_idle());
}
