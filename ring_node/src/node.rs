use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use ring_proto::hash_key;
use ring_proto::ring::ring_server::Ring;
use ring_proto::ring::{
    DeleteRequest, DeleteResponse, Empty, GetRequest, GetResponse, InsertRequest, InsertResponse,
    LookupRequest, NodeInfo, NodeState, ReplicaSyncRequest, ReplicaSyncResponse, ReplicateRequest,
    SendKeysRequest, SuccessorList,
};
use tokio::time::timeout;
use tonic::{Request, Response, Status};

use crate::constants::{
    LOOKUP_TIMEOUT_MS, OPERATION_MAX_FAILED_ATTEMPTS, OPERATION_TIMEOUT_MS, REPLICATION_COUNT,
};
use crate::fingers::FingerTable;
use crate::id;
use crate::ops::{await_follower, OpError, OpResult, Operations, Ticket};
use crate::rpc::{GrpcTransport, PeerTracker, Transport};
use crate::store::Storage;

fn lookup_timeout() -> Duration {
    Duration::from_millis(LOOKUP_TIMEOUT_MS)
}

fn operation_timeout() -> Duration {
    Duration::from_millis(OPERATION_TIMEOUT_MS)
}

/// One ring member: routing state, stores, operation managers and the
/// inbound RPC surface.
#[derive(Clone)]
pub struct Node {
    info: NodeInfo,
    pub fingers: Arc<FingerTable>,
    pub storage: Arc<Storage>,
    pub ops: Arc<Operations>,
    pub peers: Arc<PeerTracker>,
    transport: Arc<dyn Transport>,
}

impl Node {
    pub fn new(id: u64, address: String) -> Self {
        Self::with_transport(id, address, Arc::new(GrpcTransport::new()))
    }

    /// The transport is injected once; the node holds the only reference
    /// it uses for outbound traffic.
    pub fn with_transport(id: u64, address: String, transport: Arc<dyn Transport>) -> Self {
        let info = NodeInfo { id, address };
        Node {
            fingers: Arc::new(FingerTable::new(info.clone())),
            storage: Arc::new(Storage::new()),
            ops: Arc::new(Operations::new()),
            peers: Arc::new(PeerTracker::new()),
            transport,
            info,
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Bootstrap into an existing ring through `peer_addr`.
    ///
    /// Two nodes hashing to the same id cannot coexist; a collision is
    /// fatal at this point rather than a corrupted ring later.
    pub async fn join(&self, peer_addr: String) -> anyhow::Result<()> {
        let bootstrap = NodeInfo {
            id: hash_key(&peer_addr),
            address: peer_addr,
        };
        let successor = self
            .transport
            .lookup(&bootstrap, self.id())
            .await
            .map_err(|e| anyhow::anyhow!("bootstrap via {} failed: {}", bootstrap.address, e))?;
        if successor.id == self.id() {
            anyhow::bail!(
                "id collision: {} already occupies {} on the ring",
                successor.address,
                successor.id
            );
        }
        self.peers.mark_alive(bootstrap.id);
        self.fingers.update_successors(&successor);
        Ok(())
    }

    /// True iff `key_id` falls in the arc (predecessor, self] this node
    /// owns. Without a predecessor the node can only self-certify when it
    /// is alone.
    fn owns(&self, key_id: u64) -> bool {
        match self.fingers.predecessor() {
            Some(pred) => id::in_range_inclusive(key_id, pred.id, self.id()),
            None => self.fingers.successor().id == self.id(),
        }
    }

    /// One routing step: name the owner locally if possible, otherwise
    /// forward to the closest preceding live node. Runs the same rule on
    /// every hop of the lookup chain.
    pub async fn find_owner(&self, key_id: u64) -> Result<NodeInfo, Status> {
        if self.owns(key_id) {
            return Ok(self.info.clone());
        }
        let successor = self.fingers.successor();
        if successor.id != self.id() && id::in_range_inclusive(key_id, self.id(), successor.id) {
            return Ok(successor);
        }

        let mut candidates = self.fingers.candidates_for(key_id);
        candidates.extend(self.fingers.successor_list());
        let mut tried = HashSet::new();
        for candidate in candidates {
            if candidate.id == self.id()
                || !tried.insert(candidate.id)
                || self.peers.is_dead(candidate.id)
            {
                continue;
            }
            match timeout(lookup_timeout(), self.transport.lookup(&candidate, key_id)).await {
                Ok(Ok(owner)) => {
                    self.peers.mark_alive(candidate.id);
                    return Ok(owner);
                }
                Ok(Err(status)) => {
                    debug!("lookup of {} via {} failed: {}", key_id, candidate.id, status);
                    self.peers.mark_suspect(candidate.id);
                }
                Err(_) => {
                    debug!("lookup of {} via {} timed out", key_id, candidate.id);
                    self.peers.mark_suspect(candidate.id);
                }
            }
        }
        Err(Status::unavailable("no live peer could resolve the owner"))
    }

    /// Resolve the owner of `key_id`. Concurrent lookups for the same key
    /// share one future; the origin retries a bounded number of times.
    pub async fn lookup(&self, key_id: u64) -> OpResult<NodeInfo> {
        match self.ops.lookups.begin(&key_id.to_string()) {
            Ticket::Follower(rx) => await_follower(rx).await,
            Ticket::Leader(pending) => {
                let mut outcome = Err(OpError::Timeout);
                for attempt in 1..=OPERATION_MAX_FAILED_ATTEMPTS {
                    match self.find_owner(key_id).await {
                        Ok(owner) => {
                            outcome = Ok(owner);
                            break;
                        }
                        Err(status) => {
                            debug!(
                                "lookup attempt {}/{} for {} failed: {}",
                                attempt, OPERATION_MAX_FAILED_ATTEMPTS, key_id, status
                            );
                            outcome = Err(OpError::Transport(status.message().to_string()));
                        }
                    }
                }
                pending.complete(outcome.clone());
                outcome
            }
        }
    }

    /// Store `value` under `key`, wherever on the ring it belongs.
    pub async fn insert(&self, key: String, value: Vec<u8>) -> OpResult<bool> {
        match self.ops.inserts.begin(&key) {
            Ticket::Follower(rx) => await_follower(rx).await,
            Ticket::Leader(pending) => {
                let outcome = self.run_insert(&key, value).await;
                pending.complete(outcome.clone());
                outcome
            }
        }
    }

    /// Fetch the value for `key`. `Ok(None)` means the owner was found but
    /// holds no such key.
    pub async fn get(&self, key: String) -> OpResult<Option<Vec<u8>>> {
        match self.ops.gets.begin(&key) {
            Ticket::Follower(rx) => await_follower(rx).await,
            Ticket::Leader(pending) => {
                let outcome = self.run_get(&key).await;
                pending.complete(outcome.clone());
                outcome
            }
        }
    }

    /// Remove `key` from the ring. `Ok(false)` means the owner holds no
    /// such key.
    pub async fn delete(&self, key: String) -> OpResult<bool> {
        match self.ops.deletes.begin(&key) {
            Ticket::Follower(rx) => await_follower(rx).await,
            Ticket::Leader(pending) => {
                let outcome = self.run_delete(&key).await;
                pending.complete(outcome.clone());
                outcome
            }
        }
    }

    async fn run_insert(&self, key: &str, value: Vec<u8>) -> OpResult<bool> {
        let owner = self.lookup(hash_key(key)).await.map_err(|_| OpError::KeyNotFound)?;
        if owner.id == self.id() {
            return Ok(self.execute_insert(key.to_string(), value).await);
        }
        for _ in 1..=OPERATION_MAX_FAILED_ATTEMPTS {
            if !self.probe(&owner).await {
                continue;
            }
            match timeout(
                operation_timeout(),
                self.transport.insert(&owner, key.to_string(), value.clone()),
            )
            .await
            {
                Ok(Ok(success)) => {
                    self.peers.mark_alive(owner.id);
                    return Ok(success);
                }
                Ok(Err(status)) => {
                    warn!("insert of '{}' at {} failed: {}", key, owner.id, status);
                    self.peers.mark_suspect(owner.id);
                }
                Err(_) => {
                    warn!("insert of '{}' at {} timed out", key, owner.id);
                    self.peers.mark_suspect(owner.id);
                }
            }
        }
        self.inform_about_failure(&owner).await;
        Err(OpError::KeyNotFound)
    }

    async fn run_get(&self, key: &str) -> OpResult<Option<Vec<u8>>> {
        let owner = self.lookup(hash_key(key)).await.map_err(|_| OpError::KeyNotFound)?;
        if owner.id == self.id() {
            return Ok(self.storage.get_local(key).await);
        }
        for _ in 1..=OPERATION_MAX_FAILED_ATTEMPTS {
            if !self.probe(&owner).await {
                continue;
            }
            match timeout(operation_timeout(), self.transport.get(&owner, key.to_string())).await {
                Ok(Ok(value)) => {
                    self.peers.mark_alive(owner.id);
                    return Ok(value);
                }
                Ok(Err(status)) => {
                    warn!("get of '{}' at {} failed: {}", key, owner.id, status);
                    self.peers.mark_suspect(owner.id);
                }
                Err(_) => {
                    warn!("get of '{}' at {} timed out", key, owner.id);
                    self.peers.mark_suspect(owner.id);
                }
            }
        }
        self.inform_about_failure(&owner).await;
        Err(OpError::KeyNotFound)
    }

    async fn run_delete(&self, key: &str) -> OpResult<bool> {
        let owner = self.lookup(hash_key(key)).await.map_err(|_| OpError::KeyNotFound)?;
        if owner.id == self.id() {
            return Ok(self.execute_delete(key).await);
        }
        for _ in 1..=OPERATION_MAX_FAILED_ATTEMPTS {
            if !self.probe(&owner).await {
                continue;
            }
            match timeout(
                operation_timeout(),
                self.transport.delete(&owner, key.to_string()),
            )
            .await
            {
                Ok(Ok(success)) => {
                    self.peers.mark_alive(owner.id);
                    return Ok(success);
                }
                Ok(Err(status)) => {
                    warn!("delete of '{}' at {} failed: {}", key, owner.id, status);
                    self.peers.mark_suspect(owner.id);
                }
                Err(_) => {
                    warn!("delete of '{}' at {} timed out", key, owner.id);
                    self.peers.mark_suspect(owner.id);
                }
            }
        }
        self.inform_about_failure(&owner).await;
        Err(OpError::KeyNotFound)
    }

    /// Primary-side INSERT: store locally, then place replicas.
    async fn execute_insert(&self, key: String, value: Vec<u8>) -> bool {
        self.storage.insert_local(key.clone(), value.clone()).await;
        self.ensure_replication(&key, &value).await;
        true
    }

    /// Primary-side DELETE. Replica copies disappear at the next
    /// reconciliation pass.
    async fn execute_delete(&self, key: &str) -> bool {
        self.storage.clear_shortfall(key).await;
        self.storage.remove_local(key).await
    }

    /// Place `key` on successors[0..R-2]. Running short of live successors
    /// records how many replicas are still missing; a failed send declares
    /// the successor failed and retries the same slot against the repaired
    /// list.
    pub async fn ensure_replication(&self, key: &str, value: &[u8]) {
        let mut i = 1;
        while i < REPLICATION_COUNT {
            let Some(target) = self.fingers.nth_successor(i - 1) else {
                self.storage
                    .record_shortfall(key.to_string(), REPLICATION_COUNT - i)
                    .await;
                return;
            };
            if !self.probe(&target).await {
                // A stale list may still name a peer long declared dead;
                // drop it so the slot advances.
                self.inform_about_failure(&target).await;
                continue;
            }
            match self
                .transport
                .replicate(&target, self.info.clone(), key.to_string(), value.to_vec())
                .await
            {
                Ok(()) => {
                    self.peers.mark_alive(target.id);
                    i += 1;
                }
                Err(status) => {
                    warn!("replication of '{}' to {} failed: {}", key, target.id, status);
                    self.inform_about_failure(&target).await;
                }
            }
        }
        self.storage.clear_shortfall(key).await;
    }

    /// Liveness probe ahead of an outbound RPC; a failed ping declares the
    /// peer failed.
    async fn probe(&self, peer: &NodeInfo) -> bool {
        if peer.id == self.id() {
            return true;
        }
        if self.peers.is_dead(peer.id) {
            return false;
        }
        match self.transport.ping(peer).await {
            Ok(()) => {
                self.peers.mark_alive(peer.id);
                true
            }
            Err(status) => {
                debug!("ping to {} failed: {}", peer.id, status);
                self.inform_about_failure(peer).await;
                false
            }
        }
    }

    /// Accept `candidate` as predecessor when it tightens the arc,
    /// handing over the keys that now belong to it.
    pub async fn update_predecessor(&self, candidate: NodeInfo) {
        let Some(old) = self.fingers.admit_predecessor(&candidate) else {
            return;
        };
        info!(
            "new predecessor {} (was {:?})",
            candidate.id,
            old.as_ref().map(|o| o.id)
        );
        self.peers.mark_alive(candidate.id);
        self.fingers.update_finger_table(&candidate);

        let node = self.clone();
        tokio::spawn(async move {
            node.hand_over_keys(candidate).await;
        });
    }

    /// Transfer every local key the node no longer owns to its new
    /// predecessor. Keys are deleted locally only once the transfer is
    /// acknowledged; transfers to the same destination are deduplicated.
    async fn hand_over_keys(&self, p: NodeInfo) {
        let ticket = self.ops.key_sendings.begin(&p.id.to_string());
        let pending = match ticket {
            Ticket::Follower(_) => return,
            Ticket::Leader(pending) => pending,
        };

        let leaving = self.storage.entries_not_owned(p.id, self.id()).await;
        if leaving.is_empty() {
            pending.complete(Ok(true));
            return;
        }
        info!("handing over {} keys to predecessor {}", leaving.len(), p.id);
        match self.transport.send_keys(&p, leaving.clone()).await {
            Ok(()) => {
                self.storage.remove_local_keys(leaving.keys()).await;
                pending.complete(Ok(true));
            }
            Err(status) => {
                warn!("key handover to {} failed: {}", p.id, status);
                self.inform_about_failure(&p).await;
                pending.complete(Err(OpError::Transport(status.message().to_string())));
            }
        }
    }

    /// One stabilization round: reconcile the successor pointer, notify
    /// the successor, refresh the successor list.
    pub async fn stabilize(&self) {
        let successor = self.fingers.successor();
        if successor.id == self.id() {
            // Routing thinks this node is alone; a node that notified us
            // becomes the first successor.
            if let Some(p) = self.fingers.predecessor() {
                self.fingers.update_successors(&p);
            }
            return;
        }

        match self.request_predecessor(&successor).await {
            Ok(Some(p)) => {
                if p.id != self.id() && id::in_range(p.id, self.id(), successor.id) {
                    debug!("adopting {} as closer successor", p.id);
                    self.fingers.update_successors(&p);
                    self.fingers.update_finger_table(&p);
                }
            }
            Ok(None) => {}
            Err(_) => {
                warn!("successor {} unreachable during stabilization", successor.id);
                self.inform_about_failure(&successor).await;
                return;
            }
        }

        let successor = self.fingers.successor();
        if successor.id == self.id() {
            return;
        }
        if let Err(status) = self.transport.notify(&successor, self.info.clone()).await {
            warn!("notify to successor {} failed: {}", successor.id, status);
            self.inform_about_failure(&successor).await;
            return;
        }
        self.peers.mark_alive(successor.id);

        if let Ok(list) = self.transport.successor_list(&successor).await {
            self.fingers.merge_successor_list(successor, list);
        }
    }

    /// Ask `peer` for its predecessor. The seat is a node-wide singleton:
    /// concurrent stabilization rounds share one outcome.
    async fn request_predecessor(&self, peer: &NodeInfo) -> OpResult<Option<NodeInfo>> {
        match self.ops.predecessor_requests.begin("predecessor") {
            Ticket::Follower(rx) => await_follower(rx).await,
            Ticket::Leader(pending) => {
                let outcome =
                    match timeout(lookup_timeout(), self.transport.get_predecessor(peer)).await {
                        Ok(Ok(p)) => Ok(p),
                        Ok(Err(status)) => Err(OpError::Transport(status.message().to_string())),
                        Err(_) => Err(OpError::Timeout),
                    };
                pending.complete(outcome.clone());
                outcome
            }
        }
    }

    /// Refresh one finger per tick, round-robin over the table.
    pub async fn fix_fingers(&self) {
        let i = self.fingers.refresh_index();
        let target = id::finger_start(self.id(), i);
        if let Ok(owner) = self.lookup(target).await {
            self.fingers.set_finger(i, owner);
        }
    }

    /// Ping the predecessor; a dead one triggers promotion of its keys.
    pub async fn check_predecessor(&self) {
        let Some(pred) = self.fingers.predecessor() else {
            return;
        };
        if self.transport.ping(&pred).await.is_err() {
            warn!("predecessor {} failed ping", pred.id);
            self.inform_about_failure(&pred).await;
        } else {
            self.peers.mark_alive(pred.id);
        }
    }

    /// Remove `n` from every routing structure and repair replication.
    /// Declaring self failed is a programming error and is ignored.
    pub async fn inform_about_failure(&self, n: &NodeInfo) {
        if n.id == self.id() {
            error!("asked to declare self failed; ignoring");
            return;
        }
        self.peers.mark_dead(n.id);

        let removed_at = self.fingers.remove_successor(n);
        self.fingers.replace_finger(n, self.fingers.successor());
        let was_predecessor = self.fingers.clear_predecessor_if(n);

        if let Some(index) = removed_at {
            debug!("removed failed successor {} from slot {}", n.id, index);
            if index < REPLICATION_COUNT - 1 {
                self.restore_replication_tail().await;
            }
        }
        if was_predecessor {
            self.promote_predecessor_keys(n).await;
        }
    }

    /// A replica holder vanished: push the whole local store to the
    /// freshly promoted tail successor to restore the replication degree.
    async fn restore_replication_tail(&self) {
        let snapshot = self.storage.local_snapshot().await;
        if snapshot.is_empty() {
            return;
        }
        let Some(tail) = self.fingers.nth_successor(REPLICATION_COUNT - 2) else {
            for key in snapshot.keys() {
                self.storage.record_shortfall(key.clone(), 1).await;
            }
            return;
        };
        info!("re-replicating {} keys to promoted tail {}", snapshot.len(), tail.id);
        for (key, value) in snapshot {
            if self
                .transport
                .replicate(&tail, self.info.clone(), key.clone(), value)
                .await
                .is_err()
            {
                self.storage.record_shortfall(key, 1).await;
            }
        }
    }

    /// The predecessor died: this node owns its arc now. Merge the replica
    /// bucket into the local store and push the keys to the tail replica
    /// slot; anything that cannot be placed right away is recorded as a
    /// shortfall for the maintenance loop.
    async fn promote_predecessor_keys(&self, failed: &NodeInfo) {
        let Some(bucket) = self.storage.drop_origin(failed.id).await else {
            return;
        };
        info!(
            "promoting {} keys from failed predecessor {}",
            bucket.len(),
            failed.id
        );
        self.storage.extend_local(bucket.clone()).await;
        let tail = self.fingers.nth_successor(REPLICATION_COUNT - 2);
        for (key, value) in bucket {
            match &tail {
                Some(tail) => {
                    if self
                        .transport
                        .replicate(tail, self.info.clone(), key.clone(), value)
                        .await
                        .is_err()
                    {
                        self.storage.record_shortfall(key, 1).await;
                    }
                }
                None => {
                    self.storage
                        .record_shortfall(key, REPLICATION_COUNT - 1)
                        .await;
                }
            }
        }
    }

    /// Periodic replica reconciliation: confirm each bucket with the
    /// current owner of that origin's arc and prune what the owner
    /// disclaims.
    pub async fn reconcile_replicas(&self) {
        for origin_id in self.storage.replica_origins().await {
            let keys = self.storage.replica_keys(origin_id).await;
            if keys.is_empty() {
                self.storage.drop_origin(origin_id).await;
                continue;
            }
            let owner = match self.lookup(origin_id).await {
                Ok(owner) => owner,
                Err(_) => continue,
            };
            if owner.id == self.id() {
                // The origin's arc collapsed into this node: the bucket
                // is ours to own.
                if let Some(bucket) = self.storage.drop_origin(origin_id).await {
                    info!("absorbing {} keys from vanished origin {}", bucket.len(), origin_id);
                    self.storage.extend_local(bucket.clone()).await;
                    for (key, value) in bucket {
                        self.ensure_replication(&key, &value).await;
                    }
                }
                continue;
            }
            match self
                .transport
                .sync_replicas(&owner, self.info.clone(), keys)
                .await
            {
                Ok(keys_to_delete) => {
                    self.peers.mark_alive(owner.id);
                    if !keys_to_delete.is_empty() {
                        debug!(
                            "owner {} disclaimed {} replica keys of origin {}",
                            owner.id,
                            keys_to_delete.len(),
                            origin_id
                        );
                        self.storage.remove_replica_keys(origin_id, &keys_to_delete).await;
                    }
                }
                Err(status) => {
                    debug!("replica sync with {} failed: {}", owner.id, status);
                    self.peers.mark_suspect(owner.id);
                }
            }
        }
    }

    /// Retry replica placement for keys whose replication ran short.
    pub async fn retry_shortfalls(&self) {
        for (key, _missing) in self.storage.take_shortfalls().await {
            if let Some(value) = self.storage.get_local(&key).await {
                self.ensure_replication(&key, &value).await;
            }
        }
    }
}

#[tonic::async_trait]
impl Ring for Node {
    async fn lookup(
        &self,
        request: Request<LookupRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        let owner = self.find_owner(request.into_inner().id).await?;
        Ok(Response::new(owner))
    }

    async fn get_predecessor(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<NodeInfo>, Status> {
        match self.fingers.predecessor() {
            Some(predecessor) => Ok(Response::new(predecessor)),
            None => Err(Status::not_found("no predecessor")),
        }
    }

    async fn get_successor_list(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<SuccessorList>, Status> {
        Ok(Response::new(SuccessorList {
            successors: self.fingers.successor_list(),
        }))
    }

    async fn notify(&self, request: Request<NodeInfo>) -> Result<Response<Empty>, Status> {
        let candidate = request.into_inner();
        self.update_predecessor(candidate).await;
        Ok(Response::new(Empty {}))
    }

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn insert(
        &self,
        request: Request<InsertRequest>,
    ) -> Result<Response<InsertResponse>, Status> {
        let req = request.into_inner();
        debug!("insert request for '{}'", req.key);
        let success = Node::insert(self, req.key, req.value).await?;
        Ok(Response::new(InsertResponse { success }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        debug!("get request for '{}'", req.key);
        match Node::get(self, req.key).await? {
            Some(value) => Ok(Response::new(GetResponse { value, found: true })),
            None => Ok(Response::new(GetResponse {
                value: Vec::new(),
                found: false,
            })),
        }
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        debug!("delete request for '{}'", req.key);
        let success = Node::delete(self, req.key).await?;
        Ok(Response::new(DeleteResponse { success }))
    }

    async fn replicate(
        &self,
        request: Request<ReplicateRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let origin = req
            .origin
            .ok_or_else(|| Status::invalid_argument("replicate without origin"))?;
        if origin.id == self.id() {
            error!("peer {} tried to replicate onto its own origin", origin.id);
            return Ok(Response::new(Empty {}));
        }
        self.peers.mark_alive(origin.id);
        self.storage.store_replica(origin.id, req.key, req.value).await;
        Ok(Response::new(Empty {}))
    }

    async fn sync_replicas(
        &self,
        request: Request<ReplicaSyncRequest>,
    ) -> Result<Response<ReplicaSyncResponse>, Status> {
        let req = request.into_inner();
        let holder = req
            .origin
            .ok_or_else(|| Status::invalid_argument("replica sync without origin"))?;
        self.peers.mark_alive(holder.id);

        // A holder that is no longer one of our replica successors keeps
        // nothing at all.
        let is_replica_successor = (0..REPLICATION_COUNT - 1)
            .filter_map(|i| self.fingers.nth_successor(i))
            .any(|s| s.id == holder.id);
        if !is_replica_successor {
            return Ok(Response::new(ReplicaSyncResponse {
                keys_to_delete: req.keys,
            }));
        }

        let mut keys_to_delete = Vec::new();
        let mut claimed = HashSet::new();
        for key in req.keys {
            if !self.storage.contains_local(&key).await {
                keys_to_delete.push(key.clone());
            }
            claimed.insert(key);
        }

        // Push the holder whatever its claim lacks.
        let missing: Vec<(String, Vec<u8>)> = self
            .storage
            .local_snapshot()
            .await
            .into_iter()
            .filter(|(key, _)| !claimed.contains(key))
            .collect();
        if !missing.is_empty() {
            let node = self.clone();
            tokio::spawn(async move {
                for (key, value) in missing {
                    if let Err(status) = node
                        .transport
                        .replicate(&holder, node.info.clone(), key.clone(), value)
                        .await
                    {
                        debug!("replica top-up of '{}' to {} failed: {}", key, holder.id, status);
                    }
                }
            });
        }

        Ok(Response::new(ReplicaSyncResponse { keys_to_delete }))
    }

    async fn send_keys(
        &self,
        request: Request<SendKeysRequest>,
    ) -> Result<Response<Empty>, Status> {
        let entries = request.into_inner().entries;
        info!("received {} keys", entries.len());
        self.storage.extend_local(entries.clone()).await;
        for (key, value) in entries {
            self.ensure_replication(&key, &value).await;
        }
        Ok(Response::new(Empty {}))
    }

    async fn state(&self, _request: Request<Empty>) -> Result<Response<NodeState>, Status> {
        let fingers = (0..crate::constants::FINGER_TABLE_SIZE)
            .map(|i| self.fingers.finger(i))
            .collect();
        let mut stored_keys = self.storage.local_keys().await;
        stored_keys.sort();
        Ok(Response::new(NodeState {
            id: self.id(),
            address: self.info.address.clone(),
            predecessor: self.fingers.predecessor(),
            successors: self.fingers.successor_list(),
            fingers,
            stored_keys,
            replica_origins: self.storage.replica_origins().await,
        }))
    }
}
