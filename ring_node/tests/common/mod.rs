use ring_node::id::in_range_inclusive;
use ring_node::Node;
use ring_proto::hash_key;
use ring_proto::ring::ring_server::RingServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::Server;

/// Start a node on an OS-assigned port, serving in a background task.
/// Returns the node and the server task handle so tests can kill it.
#[allow(dead_code)]
pub async fn start_node() -> (Arc<Node>, tokio::task::JoinHandle<()>) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap().to_string();
    let id = hash_key(&local_addr);

    let node = Arc::new(Node::new(id, local_addr));
    let serving = node.clone();
    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(RingServer::new((*serving).clone()))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // Give the server a moment to come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (node, handle)
}

/// Drive maintenance by hand instead of waiting out the wall-clock
/// stabilization period.
#[allow(dead_code)]
pub async fn stabilize_ring(nodes: &[Arc<Node>], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.stabilize().await;
            node.fix_fingers().await;
            node.check_predecessor().await;
            node.reconcile_replicas().await;
            node.retry_shortfalls().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A key string whose id lands in the arc (start, end], i.e. one owned by
/// the node with id `end`.
#[allow(dead_code)]
pub fn key_owned_by(start: u64, end: u64) -> String {
    keys_owned_by(start, end, 1).remove(0)
}

/// The first `count` distinct key strings owned by the node with id `end`.
#[allow(dead_code)]
pub fn keys_owned_by(start: u64, end: u64, count: usize) -> Vec<String> {
    let mut keys = Vec::with_capacity(count);
    for i in 0u32.. {
        let key = format!("key-{}", i);
        if in_range_inclusive(hash_key(&key), start, end) {
            keys.push(key);
            if keys.len() == count {
                return keys;
            }
        }
    }
    unreachable!()
}
