//! Operation multiplexing.
//!
//! Every remote operation kind carries an in-flight table mapping a key to
//! the single outstanding future for that key. The first caller becomes the
//! leader and drives the operation; concurrent callers attach to the same
//! outcome. Completion removes the entry, so a retry after failure starts
//! fresh.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use ring_proto::ring::NodeInfo;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tonic::Status;

use crate::constants::OPERATION_TIMEOUT_MS;

/// Failure modes of ring operations. Cloneable so one outcome can be
/// broadcast to every caller attached to a shared future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out")]
    Timeout,
    #[error("key not found")]
    KeyNotFound,
    #[error("peer is self")]
    SelfReference,
}

pub type OpResult<T> = Result<T, OpError>;

impl From<OpError> for Status {
    fn from(e: OpError) -> Status {
        match e {
            OpError::Transport(msg) => Status::unavailable(msg),
            OpError::Timeout => Status::deadline_exceeded("operation timed out"),
            OpError::KeyNotFound => Status::not_found("key not found"),
            OpError::SelfReference => Status::internal("self-referential peer"),
        }
    }
}

pub struct InFlight<R: Clone> {
    pending: Mutex<HashMap<String, broadcast::Sender<OpResult<R>>>>,
}

/// Outcome of claiming a key in an in-flight table.
pub enum Ticket<'a, R: Clone> {
    /// First caller: runs the operation and must complete the seat.
    Leader(Pending<'a, R>),
    /// Duplicate caller: awaits the leader's outcome.
    Follower(broadcast::Receiver<OpResult<R>>),
}

/// A claimed seat. Dropping it without completing broadcasts a transport
/// failure so cancelled leaders never strand their followers.
pub struct Pending<'a, R: Clone> {
    table: &'a InFlight<R>,
    key: String,
    completed: bool,
}

impl<R: Clone> InFlight<R> {
    pub fn new() -> Self {
        InFlight {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic put-if-absent on the key's seat.
    pub fn begin(&self, key: &str) -> Ticket<'_, R> {
        let mut pending = self.pending.lock().unwrap();
        if let Some(tx) = pending.get(key) {
            return Ticket::Follower(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        pending.insert(key.to_string(), tx);
        Ticket::Leader(Pending {
            table: self,
            key: key.to_string(),
            completed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    fn finish(&self, key: &str, outcome: OpResult<R>) {
        let tx = self.pending.lock().unwrap().remove(key);
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

impl<R: Clone> Default for InFlight<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone> Pending<'_, R> {
    /// Complete the shared future and release the key.
    pub fn complete(mut self, outcome: OpResult<R>) {
        self.completed = true;
        self.table.finish(&self.key, outcome);
    }
}

impl<R: Clone> Drop for Pending<'_, R> {
    fn drop(&mut self) {
        if !self.completed {
            self.table
                .finish(&self.key, Err(OpError::Transport("operation abandoned".into())));
        }
    }
}

/// Await a follower ticket, bounded by the operation timeout.
pub async fn await_follower<R: Clone>(mut rx: broadcast::Receiver<OpResult<R>>) -> OpResult<R> {
    match timeout(Duration::from_millis(OPERATION_TIMEOUT_MS), rx.recv()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(OpError::Transport("in-flight operation dropped".into())),
        Err(_) => Err(OpError::Timeout),
    }
}

/// The per-node operation managers, one table per operation kind.
pub struct Operations {
    pub inserts: InFlight<bool>,
    pub gets: InFlight<Option<Vec<u8>>>,
    pub deletes: InFlight<bool>,
    pub lookups: InFlight<NodeInfo>,
    pub key_sendings: InFlight<bool>,
    pub predecessor_requests: InFlight<Option<NodeInfo>>,
}

impl Operations {
    pub fn new() -> Self {
        Operations {
            inserts: InFlight::new(),
            gets: InFlight::new(),
            deletes: InFlight::new(),
            lookups: InFlight::new(),
            key_sendings: InFlight::new(),
            predecessor_requests: InFlight::new(),
        }
    }

    /// True when no operation of any kind is outstanding.
    pub fn is_idle(&self) -> bool {
        self.inserts.is_empty()
            && self.gets.is_empty()
            && self.deletes.is_empty()
            && self.lookups.is_empty()
            && self.key_sendings.is_empty()
            && self.predecessor_requests.is_empty()
    }
}

impl Default for Operations {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_attaches_to_the_same_future() {
        let table: InFlight<u32> = InFlight::new();

        let leader = match table.begin("k") {
            Ticket::Leader(p) => p,
            Ticket::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match table.begin("k") {
            Ticket::Follower(rx) => rx,
            Ticket::Leader(_) => panic!("second caller must follow"),
        };
        assert_eq!(table.len(), 1);

        leader.complete(Ok(7));
        assert_eq!(await_follower(follower).await, Ok(7));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn completion_releases_the_key_for_retries() {
        let table: InFlight<u32> = InFlight::new();
        match table.begin("k") {
            Ticket::Leader(p) => p.complete(Err(OpError::KeyNotFound)),
            Ticket::Follower(_) => panic!(),
        }
        // The key is free again: a retry gets a fresh seat.
        assert!(matches!(table.begin("k"), Ticket::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_leader_fails_followers_instead_of_stranding_them() {
        let table: InFlight<u32> = InFlight::new();
        let leader = match table.begin("k") {
            Ticket::Leader(p) => p,
            Ticket::Follower(_) => panic!(),
        };
        let follower = match table.begin("k") {
            Ticket::Follower(rx) => rx,
            Ticket::Leader(_) => panic!(),
        };

        drop(leader);
        assert!(matches!(
            await_follower(follower).await,
            Err(OpError::Transport(_))
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn keys_do_not_interfere() {
        let table: InFlight<u32> = InFlight::new();
        let a = table.begin("a");
        let b = table.begin("b");
        assert!(matches!(a, Ticket::Leader(_)));
        assert!(matches!(b, Ticket::Leader(_)));
        assert_eq!(table.len(), 2);
    }
}
