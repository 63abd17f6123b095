use std::time::Duration;

use ring_proto::ring::ring_server::Ring;
use ring_proto::ring::{NodeInfo, ReplicaSyncRequest};
use tonic::Request;

mod common;
use common::{keys_owned_by, stabilize_ring, start_node};

#[tokio::test]
async fn owner_disclaims_stale_replicas_and_tops_up_missing_ones() {
    let (a, _server_a) = start_node().await;
    let (b, _server_b) = start_node().await;
    b.join(a.address().to_string()).await.expect("join failed");
    stabilize_ring(&[a.clone(), b.clone()], 6).await;

    let mut owned = keys_owned_by(b.id(), a.id(), 2).into_iter();
    let live = owned.next().unwrap();
    let missing = owned.next().unwrap();

    // A normally inserted key: its replica already sits on b.
    assert!(a.insert(live.clone(), b"live".to_vec()).await.unwrap());
    assert!(b.storage.replica_value(a.id(), &live).await.is_some());

    // A key the owner has never heard of must be disclaimed.
    b.storage
        .store_replica(a.id(), "stale_key".into(), b"old".to_vec())
        .await;
    // A key the owner holds but b's bucket lacks must be topped up.
    a.storage.insert_local(missing.clone(), b"fresh".to_vec()).await;

    b.reconcile_replicas().await;

    assert!(b.storage.replica_value(a.id(), "stale_key").await.is_none());
    assert_eq!(b.storage.replica_value(a.id(), &live).await.unwrap(), b"live");

    // The top-up is pushed from the owner's side.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        b.storage.replica_value(a.id(), &missing).await.unwrap(),
        b"fresh"
    );
}

#[tokio::test]
async fn foreign_holders_are_told_to_drop_everything() {
    // A lone node has no replica successors, so any syncing holder is a
    // stranger whose whole claim gets disclaimed.
    let (a, _server_a) = start_node().await;
    let stranger = NodeInfo {
        id: a.id().wrapping_add(7),
        address: "127.0.0.1:7103".into(),
    };

    let response = Ring::sync_replicas(
        a.as_ref(),
        Request::new(ReplicaSyncRequest {
            origin: Some(stranger),
            keys: vec!["x".into(), "y".into()],
        }),
    )
    .await
    .unwrap()
    .into_inner();

    let mut disclaimed = response.keys_to_delete;
    disclaimed.sort();
    assert_eq!(disclaimed, vec!["x".to_string(), "y".to_string()]);
}
