//! Reply bookkeeping for a single node.
//!
//! `PendingReplies` tracks who still has to grant the current request,
//! `DeferredQueue` tracks whose requests this node is holding back.
//! Peer sets use a fixed-size bitset instead of a HashSet: node ids are
//! small and the set is rebuilt on every request.

use std::collections::VecDeque;

use super::{NodeId, Timestamp};

/// Maximum supported cluster size (64 nodes).
/// Node ids must be below this value.
pub const MAX_CLUSTER_SIZE: u32 = 64;

/// A compact bitset of node ids.
///
/// Bit N is set if node N is a member.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeBitset(u64);

impl NodeBitset {
    /// Create an empty bitset.
    #[inline]
    pub fn new() -> Self {
        NodeBitset(0)
    }

    /// Set the bit for a node ID.
    #[inline]
    pub fn insert(&mut self, node_id: NodeId) {
        debug_assert!(node_id < MAX_CLUSTER_SIZE, "node_id exceeds MAX_CLUSTER_SIZE");
        self.0 |= 1u64 << node_id;
    }

    /// Clear the bit for a node ID. Returns true if it was set.
    #[inline]
    pub fn remove(&mut self, node_id: NodeId) -> bool {
        if !self.contains(node_id) {
            return false;
        }
        self.0 &= !(1u64 << node_id);
        true
    }

    #[inline]
    pub fn contains(&self, node_id: NodeId) -> bool {
        node_id < MAX_CLUSTER_SIZE && (self.0 & (1u64 << node_id)) != 0
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Node ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let bits = self.0;
        (0..MAX_CLUSTER_SIZE).filter(move |id| bits & (1u64 << id) != 0)
    }
}

impl std::fmt::Debug for NodeBitset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<NodeId> for NodeBitset {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = NodeBitset::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// Peers whose REPLY the current request is still waiting for.
///
/// Filled with every live peer when a request starts and only ever
/// shrinks afterwards. Removal is idempotent, so a duplicate REPLY can
/// neither double count nor underflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingReplies {
    waiting: NodeBitset,
}

impl PendingReplies {
    pub fn new() -> Self {
        PendingReplies::default()
    }

    /// Start waiting on the given peers, replacing any previous set.
    pub fn expect(&mut self, peers: NodeBitset) {
        self.waiting = peers;
    }

    /// Record a grant. Returns true only if `peer` was still outstanding.
    pub fn grant(&mut self, peer: NodeId) -> bool {
        self.waiting.remove(peer)
    }

    /// Stop waiting on a peer that is presumed dead.
    pub fn forget(&mut self, peer: NodeId) -> bool {
        self.waiting.remove(peer)
    }

    pub fn is_waiting_on(&self, peer: NodeId) -> bool {
        self.waiting.contains(peer)
    }

    /// True once every expected peer has replied.
    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiting.count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }

    pub fn peers(&self) -> NodeBitset {
        self.waiting
    }
}

/// A REQUEST this node is holding back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredRequest {
    pub peer: NodeId,
    pub timestamp: Timestamp,
}

/// FIFO of requests whose REPLY is withheld until this node leaves the
/// critical section (or abandons its own request).
///
/// Each peer appears at most once: a repeated REQUEST from a peer that is
/// already queued refreshes the timestamp in place and keeps its position.
#[derive(Debug, Clone, Default)]
pub struct DeferredQueue {
    queue: VecDeque<DeferredRequest>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        DeferredQueue::default()
    }

    /// Queue a request. Returns false if the peer was already queued.
    pub fn defer(&mut self, peer: NodeId, timestamp: Timestamp) -> bool {
        if let Some(existing) = self.queue.iter_mut().find(|d| d.peer == peer) {
            existing.timestamp = existing.timestamp.max(timestamp);
            return false;
        }
        self.queue.push_back(DeferredRequest { peer, timestamp });
        true
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.queue.iter().any(|d| d.peer == peer)
    }

    /// Remove and return every queued request, oldest first.
    pub fn drain(&mut self) -> Vec<DeferredRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredRequest> {
        self.queue.iter()
    }
}
