//! Routing state of a node: finger table, successor list and predecessor.
//!
//! Every slot is individually locked and no guard is held across an await,
//! so a reader may observe a stale entry but never a torn one. The node's
//! own identity is fixed for the lifetime of the table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use ring_proto::ring::NodeInfo;

use crate::constants::{FINGER_TABLE_SIZE, SUCCESSOR_LIST_LIMIT};
use crate::id;

pub struct FingerTable {
    home: NodeInfo,
    fingers: Vec<RwLock<NodeInfo>>,
    successors: RwLock<Vec<NodeInfo>>,
    predecessor: RwLock<Option<NodeInfo>>,
    refresh_cursor: AtomicUsize,
}

impl FingerTable {
    /// A fresh table describes a single-node ring: every finger points at
    /// the node itself and the successor list holds only the node.
    pub fn new(home: NodeInfo) -> Self {
        let fingers = (0..FINGER_TABLE_SIZE)
            .map(|_| RwLock::new(home.clone()))
            .collect();
        FingerTable {
            fingers,
            successors: RwLock::new(vec![home.clone()]),
            predecessor: RwLock::new(None),
            refresh_cursor: AtomicUsize::new(0),
            home,
        }
    }

    pub fn home(&self) -> &NodeInfo {
        &self.home
    }

    /// The immediate successor. Falls back to the node itself when alone.
    pub fn successor(&self) -> NodeInfo {
        self.successors
            .read()
            .unwrap()
            .first()
            .cloned()
            .unwrap_or_else(|| self.home.clone())
    }

    /// The i-th entry of the successor list (0-based), or `None` when the
    /// slot is absent or degenerates to the node itself.
    pub fn nth_successor(&self, i: usize) -> Option<NodeInfo> {
        self.successors
            .read()
            .unwrap()
            .get(i)
            .filter(|s| s.id != self.home.id)
            .cloned()
    }

    pub fn successor_list(&self) -> Vec<NodeInfo> {
        self.successors.read().unwrap().clone()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.predecessor.read().unwrap().clone()
    }

    pub fn clear_predecessor(&self) {
        *self.predecessor.write().unwrap() = None;
    }

    /// Accept `p` as predecessor iff it tightens the arc (p.id, home.id).
    ///
    /// Returns `Some(previous)` on acceptance. A candidate at the current
    /// predecessor's id is equality, not an improvement, and is rejected.
    pub fn admit_predecessor(&self, p: &NodeInfo) -> Option<Option<NodeInfo>> {
        if p.id == self.home.id {
            return None;
        }
        let mut slot = self.predecessor.write().unwrap();
        let accepted = match slot.as_ref() {
            None => true,
            Some(current) => id::in_range(p.id, current.id, self.home.id),
        };
        if accepted {
            let old = slot.take();
            *slot = Some(p.clone());
            Some(old)
        } else {
            None
        }
    }

    pub fn finger(&self, i: usize) -> NodeInfo {
        self.fingers[i].read().unwrap().clone()
    }

    pub fn set_finger(&self, i: usize, node: NodeInfo) {
        *self.fingers[i].write().unwrap() = node;
    }

    /// The finger whose id is the largest preceding `key` in ring order;
    /// the node itself when no finger precedes the key.
    pub fn next_best(&self, key: u64) -> NodeInfo {
        for slot in self.fingers.iter().rev() {
            let finger = slot.read().unwrap();
            if finger.id != self.home.id && id::in_range(finger.id, self.home.id, key) {
                return finger.clone();
            }
        }
        self.home.clone()
    }

    /// All fingers preceding `key`, closest first, deduplicated. Used by
    /// the lookup forwarding loop so a dead best finger does not strand
    /// the query.
    pub fn candidates_for(&self, key: u64) -> Vec<NodeInfo> {
        let mut candidates: Vec<NodeInfo> = Vec::new();
        for slot in self.fingers.iter() {
            let finger = slot.read().unwrap();
            if finger.id != self.home.id && id::in_range(finger.id, self.home.id, key) {
                candidates.push(finger.clone());
            }
        }
        candidates.sort_by_key(|n| std::cmp::Reverse(id::distance(self.home.id, n.id)));
        candidates.dedup_by_key(|n| n.id);
        candidates
    }

    /// Insert `n` into the successor list at its ring position. Self is
    /// never admitted through this path.
    pub fn update_successors(&self, n: &NodeInfo) {
        if n.id == self.home.id {
            return;
        }
        let mut successors = self.successors.write().unwrap();
        let mut list = successors.clone();
        list.push(n.clone());
        *successors = self.normalized(list);
    }

    /// Adopt `head` as immediate successor and splice in the tail it
    /// reported, keeping the list bounded and free of self-references.
    pub fn merge_successor_list(&self, head: NodeInfo, tail: Vec<NodeInfo>) {
        let mut list = vec![head];
        list.extend(tail);
        let mut successors = self.successors.write().unwrap();
        *successors = self.normalized(list);
    }

    /// Drop every occurrence of `n`, reporting the slot it held. An emptied
    /// list degenerates back to the node itself.
    pub fn remove_successor(&self, n: &NodeInfo) -> Option<usize> {
        let mut successors = self.successors.write().unwrap();
        let index = successors.iter().position(|s| s.id == n.id);
        successors.retain(|s| s.id != n.id);
        if successors.is_empty() {
            successors.push(self.home.clone());
        }
        index
    }

    /// Point every finger slot holding `n` at `replacement`.
    pub fn replace_finger(&self, n: &NodeInfo, replacement: NodeInfo) {
        for slot in self.fingers.iter() {
            let mut finger = slot.write().unwrap();
            if finger.id == n.id {
                *finger = replacement.clone();
            }
        }
    }

    /// Clear the predecessor slot if it names `n`. Returns whether it did.
    pub fn clear_predecessor_if(&self, n: &NodeInfo) -> bool {
        let mut slot = self.predecessor.write().unwrap();
        if slot.as_ref().map(|p| p.id) == Some(n.id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Install `n` in every finger slot it beats: strictly smaller
    /// clockwise distance from the slot's ideal id. Ties keep the
    /// incumbent.
    pub fn update_finger_table(&self, n: &NodeInfo) {
        if n.id == self.home.id {
            return;
        }
        for (i, slot) in self.fingers.iter().enumerate() {
            let start = id::finger_start(self.home.id, i);
            let mut finger = slot.write().unwrap();
            if id::distance(start, n.id) < id::distance(start, finger.id) {
                *finger = n.clone();
            }
        }
    }

    /// Round-robin cursor over the finger table, one slot per call.
    pub fn refresh_index(&self) -> usize {
        self.refresh_cursor.fetch_add(1, Ordering::Relaxed) % FINGER_TABLE_SIZE
    }

    /// Ring order from home, self filtered out, bounded, deduplicated.
    /// An empty result degenerates to the node itself.
    fn normalized(&self, list: Vec<NodeInfo>) -> Vec<NodeInfo> {
        let mut seen = HashSet::new();
        let mut list: Vec<NodeInfo> = list
            .into_iter()
            .filter(|n| n.id != self.home.id && seen.insert(n.id))
            .collect();
        list.sort_by_key(|n| id::distance(self.home.id, n.id));
        list.truncate(SUCCESSOR_LIST_LIMIT);
        if list.is_empty() {
            list.push(self.home.clone());
        }
        list
    }
}
