//! Outbound RPC plumbing.
//!
//! The ring core talks to peers through the [`Transport`] trait; the
//! default [`GrpcTransport`] keeps one pooled channel per destination.
//! [`PeerTracker`] records the liveness of every peer this node has
//! exchanged messages with.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use ring_proto::ring::ring_client::RingClient;
use ring_proto::ring::{
    DeleteRequest, Empty, GetRequest, InsertRequest, LookupRequest, NodeInfo, ReplicaSyncRequest,
    ReplicateRequest, SendKeysRequest,
};
use tokio::time::timeout;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use crate::constants::{CONNECT_TIMEOUT_MS, MAX_POOLED_CONNECTIONS, PING_TIMEOUT_MS};

/// Liveness of a peer as observed from this node.
///
/// Any successful exchange makes a peer alive, one failed send makes it
/// suspect, exhausted retries or a failed ping make it dead. Dead is
/// terminal for that incarnation; a new arrival under the same id revives
/// on its first successful exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

pub struct PeerTracker {
    states: Mutex<HashMap<u64, PeerState>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        PeerTracker {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_alive(&self, id: u64) {
        self.states.lock().unwrap().insert(id, PeerState::Alive);
    }

    /// One failed send. Never resurrects a dead peer.
    pub fn mark_suspect(&self, id: u64) {
        let mut states = self.states.lock().unwrap();
        match states.get(&id) {
            Some(PeerState::Dead) => {}
            _ => {
                states.insert(id, PeerState::Suspect);
            }
        }
    }

    pub fn mark_dead(&self, id: u64) {
        self.states.lock().unwrap().insert(id, PeerState::Dead);
    }

    pub fn is_dead(&self, id: u64) -> bool {
        self.state(id) == Some(PeerState::Dead)
    }

    pub fn state(&self, id: u64) -> Option<PeerState> {
        self.states.lock().unwrap().get(&id).copied()
    }
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The node's one outbound interface, injected at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn lookup(&self, peer: &NodeInfo, id: u64) -> Result<NodeInfo, Status>;
    async fn get_predecessor(&self, peer: &NodeInfo) -> Result<Option<NodeInfo>, Status>;
    async fn successor_list(&self, peer: &NodeInfo) -> Result<Vec<NodeInfo>, Status>;
    async fn notify(&self, peer: &NodeInfo, node: NodeInfo) -> Result<(), Status>;
    async fn ping(&self, peer: &NodeInfo) -> Result<(), Status>;
    async fn insert(&self, peer: &NodeInfo, key: String, value: Vec<u8>) -> Result<bool, Status>;
    async fn get(&self, peer: &NodeInfo, key: String) -> Result<Option<Vec<u8>>, Status>;
    async fn delete(&self, peer: &NodeInfo, key: String) -> Result<bool, Status>;
    async fn replicate(
        &self,
        peer: &NodeInfo,
        origin: NodeInfo,
        key: String,
        value: Vec<u8>,
    ) -> Result<(), Status>;
    async fn sync_replicas(
        &self,
        peer: &NodeInfo,
        origin: NodeInfo,
        keys: Vec<String>,
    ) -> Result<Vec<String>, Status>;
    async fn send_keys(
        &self,
        peer: &NodeInfo,
        entries: HashMap<String, Vec<u8>>,
    ) -> Result<(), Status>;
}

/// gRPC transport with a channel pool keyed by destination id.
pub struct GrpcTransport {
    channels: Mutex<HashMap<u64, Channel>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        GrpcTransport {
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, peer: &NodeInfo) -> Result<RingClient<Channel>, Status> {
        let pooled = self.channels.lock().unwrap().get(&peer.id).cloned();
        if let Some(channel) = pooled {
            return Ok(RingClient::new(channel));
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", peer.address))
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_millis(CONNECT_TIMEOUT_MS));
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        let mut pool = self.channels.lock().unwrap();
        if pool.len() >= MAX_POOLED_CONNECTIONS {
            if let Some(evicted) = pool.keys().next().copied() {
                debug!("connection pool full, evicting channel to {}", evicted);
                pool.remove(&evicted);
            }
        }
        pool.insert(peer.id, channel.clone());
        Ok(RingClient::new(channel))
    }

    /// Forget the pooled channel after a send failure so the next attempt
    /// reconnects instead of reusing a broken stream.
    fn evict(&self, peer: &NodeInfo) {
        self.channels.lock().unwrap().remove(&peer.id);
    }

    fn failed(&self, peer: &NodeInfo, status: Status) -> Status {
        self.evict(peer);
        status
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn lookup(&self, peer: &NodeInfo, id: u64) -> Result<NodeInfo, Status> {
        let mut client = self.client(peer).await?;
        match client.lookup(Request::new(LookupRequest { id })).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn get_predecessor(&self, peer: &NodeInfo) -> Result<Option<NodeInfo>, Status> {
        let mut client = self.client(peer).await?;
        match client.get_predecessor(Request::new(Empty {})).await {
            Ok(response) => Ok(Some(response.into_inner())),
            // A peer without a predecessor is healthy, just young.
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn successor_list(&self, peer: &NodeInfo) -> Result<Vec<NodeInfo>, Status> {
        let mut client = self.client(peer).await?;
        match client.get_successor_list(Request::new(Empty {})).await {
            Ok(response) => Ok(response.into_inner().successors),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn notify(&self, peer: &NodeInfo, node: NodeInfo) -> Result<(), Status> {
        let mut client = self.client(peer).await?;
        match client.notify(Request::new(node)).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn ping(&self, peer: &NodeInfo) -> Result<(), Status> {
        let mut client = self.client(peer).await?;
        let probe = timeout(
            Duration::from_millis(PING_TIMEOUT_MS),
            client.ping(Request::new(Empty {})),
        );
        match probe.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(self.failed(peer, status)),
            Err(_) => Err(self.failed(peer, Status::deadline_exceeded("ping timed out"))),
        }
    }

    async fn insert(&self, peer: &NodeInfo, key: String, value: Vec<u8>) -> Result<bool, Status> {
        let mut client = self.client(peer).await?;
        match client.insert(Request::new(InsertRequest { key, value })).await {
            Ok(response) => Ok(response.into_inner().success),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn get(&self, peer: &NodeInfo, key: String) -> Result<Option<Vec<u8>>, Status> {
        let mut client = self.client(peer).await?;
        match client.get(Request::new(GetRequest { key })).await {
            Ok(response) => {
                let response = response.into_inner();
                Ok(response.found.then_some(response.value))
            }
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn delete(&self, peer: &NodeInfo, key: String) -> Result<bool, Status> {
        let mut client = self.client(peer).await?;
        match client.delete(Request::new(DeleteRequest { key })).await {
            Ok(response) => Ok(response.into_inner().success),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn replicate(
        &self,
        peer: &NodeInfo,
        origin: NodeInfo,
        key: String,
        value: Vec<u8>,
    ) -> Result<(), Status> {
        let mut client = self.client(peer).await?;
        let request = ReplicateRequest {
            origin: Some(origin),
            key,
            value,
        };
        match client.replicate(Request::new(request)).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn sync_replicas(
        &self,
        peer: &NodeInfo,
        origin: NodeInfo,
        keys: Vec<String>,
    ) -> Result<Vec<String>, Status> {
        let mut client = self.client(peer).await?;
        let request = ReplicaSyncRequest {
            origin: Some(origin),
            keys,
        };
        match client.sync_replicas(Request::new(request)).await {
            Ok(response) => Ok(response.into_inner().keys_to_delete),
            Err(status) => Err(self.failed(peer, status)),
        }
    }

    async fn send_keys(
        &self,
        peer: &NodeInfo,
        entries: HashMap<String, Vec<u8>>,
    ) -> Result<(), Status> {
        let mut client = self.client(peer).await?;
        match client.send_keys(Request::new(SendKeysRequest { entries })).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.failed(peer, status)),
        }
    }
}
