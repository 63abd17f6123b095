//! Key-value state of a node.
//!
//! `local` holds the keys this node owns as primary. `replicas` holds one
//! bucket per origin node whose keys this node stores as a replica.
//! `shortfalls` records keys whose replication ran short of live
//! successors; the maintenance loop drains it.

use std::collections::HashMap;

use ring_proto::hash_key;
use tokio::sync::RwLock;

use crate::id;

pub struct Storage {
    local: RwLock<HashMap<String, Vec<u8>>>,
    replicas: RwLock<HashMap<u64, HashMap<String, Vec<u8>>>>,
    shortfalls: RwLock<HashMap<String, usize>>,
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            local: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            shortfalls: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_local(&self, key: String, value: Vec<u8>) {
        self.local.write().await.insert(key, value);
    }

    pub async fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.local.read().await.get(key).cloned()
    }

    pub async fn remove_local(&self, key: &str) -> bool {
        self.local.write().await.remove(key).is_some()
    }

    pub async fn contains_local(&self, key: &str) -> bool {
        self.local.read().await.contains_key(key)
    }

    pub async fn local_keys(&self) -> Vec<String> {
        self.local.read().await.keys().cloned().collect()
    }

    pub async fn local_snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.local.read().await.clone()
    }

    pub async fn extend_local(&self, entries: HashMap<String, Vec<u8>>) {
        self.local.write().await.extend(entries);
    }

    /// Entries whose key ids fall outside the arc (start, end] this node
    /// owns. Copies, does not remove: the caller deletes with
    /// [`remove_local_keys`](Self::remove_local_keys) once the transfer is
    /// acknowledged.
    pub async fn entries_not_owned(&self, start: u64, end: u64) -> HashMap<String, Vec<u8>> {
        self.local
            .read()
            .await
            .iter()
            .filter(|(key, _)| !id::in_range_inclusive(hash_key(key), start, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn remove_local_keys<'a>(&self, keys: impl Iterator<Item = &'a String>) {
        let mut local = self.local.write().await;
        for key in keys {
            local.remove(key);
        }
    }

    pub async fn store_replica(&self, origin: u64, key: String, value: Vec<u8>) {
        self.replicas
            .write()
            .await
            .entry(origin)
            .or_default()
            .insert(key, value);
    }

    pub async fn replica_origins(&self) -> Vec<u64> {
        self.replicas.read().await.keys().copied().collect()
    }

    pub async fn replica_keys(&self, origin: u64) -> Vec<String> {
        self.replicas
            .read()
            .await
            .get(&origin)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn replica_value(&self, origin: u64, key: &str) -> Option<Vec<u8>> {
        self.replicas
            .read()
            .await
            .get(&origin)
            .and_then(|bucket| bucket.get(key).cloned())
    }

    /// Remove `keys` from the origin's bucket, dropping the bucket once
    /// emptied.
    pub async fn remove_replica_keys(&self, origin: u64, keys: &[String]) {
        let mut replicas = self.replicas.write().await;
        if let Some(bucket) = replicas.get_mut(&origin) {
            for key in keys {
                bucket.remove(key);
            }
            if bucket.is_empty() {
                replicas.remove(&origin);
            }
        }
    }

    /// Take the whole bucket for `origin`, e.g. for promotion into the
    /// local store when the origin fails.
    pub async fn drop_origin(&self, origin: u64) -> Option<HashMap<String, Vec<u8>>> {
        self.replicas.write().await.remove(&origin)
    }

    pub async fn record_shortfall(&self, key: String, missing: usize) {
        self.shortfalls.write().await.insert(key, missing);
    }

    pub async fn clear_shortfall(&self, key: &str) {
        self.shortfalls.write().await.remove(key);
    }

    pub async fn shortfall(&self, key: &str) -> Option<usize> {
        self.shortfalls.read().await.get(key).copied()
    }

    pub async fn take_shortfalls(&self) -> HashMap<String, usize> {
        std::mem::take(&mut *self.shortfalls.write().await)
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
