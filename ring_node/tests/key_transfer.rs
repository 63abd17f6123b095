mod common;
use common::{key_owned_by, stabilize_ring, start_node};

#[tokio::test]
async fn admission_hands_over_keys_to_the_new_owner() {
    let (a, _server_a) = start_node().await;
    // b exists but has not joined yet, so a still owns the whole ring.
    let (b, _server_b) = start_node().await;

    // Pick a key that b will own once it is admitted.
    let key = key_owned_by(a.id(), b.id());
    assert!(a.insert(key.clone(), b"moved".to_vec()).await.unwrap());
    assert!(a.storage.contains_local(&key).await);

    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 8).await;

    assert!(
        b.storage.contains_local(&key).await,
        "key did not move to its new owner"
    );
    assert!(
        !a.storage.contains_local(&key).await,
        "old owner kept a key it no longer owns"
    );

    // Still readable from either side of the ring.
    assert_eq!(a.get(key.clone()).await.unwrap().unwrap(), b"moved");
    assert_eq!(b.get(key.clone()).await.unwrap().unwrap(), b"moved");
}

#[tokio::test]
async fn keys_owned_by_the_old_node_stay_put() {
    let (a, _server_a) = start_node().await;
    let (b, _server_b) = start_node().await;

    // A key in (b, a] stays with a even after b is admitted.
    let key = key_owned_by(b.id(), a.id());
    assert!(a.insert(key.clone(), b"kept".to_vec()).await.unwrap());

    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 8).await;

    assert!(a.storage.contains_local(&key).await);
    assert!(!b.storage.contains_local(&key).await);
    assert_eq!(b.get(key).await.unwrap().unwrap(), b"kept");
}
