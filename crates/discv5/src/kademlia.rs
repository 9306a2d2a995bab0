//! Component C: the Kademlia routing table.
//!
//! 256 distance-bucketed, insertion-ordered lists of at most `bucket_size`
//! node ids each, with a same-capacity replacement cache per bucket that
//! absorbs nodes bumped out of a full bucket. Bucket index is
//! `⌊log2(local ⊕ remote)⌋ + 1`, computed by [`crate::node::log_distance`].

use crate::node::{log_distance, NodeId};
use rand::seq::SliceRandom;
use std::collections::VecDeque;

pub const DEFAULT_BUCKET_SIZE: usize = 16;
pub const NUM_BUCKETS: usize = 256;

#[derive(Debug, Default, Clone)]
struct Bucket {
    /// Head is least-recently witnessed, tail is most-recently witnessed.
    nodes: VecDeque<NodeId>,
    /// Same ordering convention as `nodes`; candidates waiting for a slot.
    replacements: VecDeque<NodeId>,
}

/// A Kademlia routing table keyed by XOR distance to `local_node_id`.
#[derive(Debug)]
pub struct RoutingTable {
    local_node_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_node_id: NodeId) -> Self {
        Self::with_bucket_size(local_node_id, DEFAULT_BUCKET_SIZE)
    }

    pub fn with_bucket_size(local_node_id: NodeId, bucket_size: usize) -> Self {
        Self {
            local_node_id,
            bucket_size,
            buckets: vec![Bucket::default(); NUM_BUCKETS],
        }
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn num_buckets(&self) -> usize {
        NUM_BUCKETS
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Index in `[0, 256)` for `bucket index (1-based) - 1`, or `None` if
    /// `node_id` is the local id (never stored).
    fn bucket_index(&self, node_id: NodeId) -> Option<usize> {
        if node_id == self.local_node_id {
            return None;
        }
        Some(log_distance(self.local_node_id, node_id) - 1)
    }

    /// Witnesses `node_id`.
    ///
    /// * If already present in its bucket, moves it to the tail.
    /// * Else if the bucket has room, appends it.
    /// * Else pushes it to the head of the replacement cache (evicting the
    ///   oldest replacement if that cache is also full) and returns the
    ///   current head of the bucket as an eviction candidate for the caller
    ///   to probe.
    pub fn update(&mut self, node_id: NodeId) -> Option<NodeId> {
        let idx = self.bucket_index(node_id)?;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.nodes.iter().position(|n| *n == node_id) {
            bucket.nodes.remove(pos);
            bucket.nodes.push_back(node_id);
            return None;
        }

        if bucket.nodes.len() < self.bucket_size {
            bucket.nodes.push_back(node_id);
            return None;
        }

        if bucket.replacements.len() >= self.bucket_size {
            bucket.replacements.pop_back();
        }
        bucket.replacements.push_front(node_id);
        bucket.nodes.front().copied()
    }

    /// Drops `node_id` from its bucket, promoting the head of the
    /// replacement cache into the vacated tail slot, if any.
    pub fn remove(&mut self, node_id: NodeId) {
        let Some(idx) = self.bucket_index(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.nodes.iter().position(|n| *n == node_id) else {
            return;
        };
        bucket.nodes.remove(pos);
        if let Some(replacement) = bucket.replacements.pop_front() {
            bucket.nodes.push_back(replacement);
        }
    }

    /// Returns `true` if `node_id` is currently a live member of the table
    /// (not merely a replacement candidate).
    pub fn contains(&self, node_id: NodeId) -> bool {
        match self.bucket_index(node_id) {
            Some(idx) => self.buckets[idx].nodes.contains(&node_id),
            None => false,
        }
    }

    /// The bucket at 1-based log distance `d` (so `d=1..=256`), head-to-tail
    /// (least-recently witnessed first).
    pub fn get_nodes_at_log_distance(&self, d: usize) -> Vec<NodeId> {
        if d == 0 || d > NUM_BUCKETS {
            return Vec::new();
        }
        self.buckets[d - 1].nodes.iter().copied().collect()
    }

    /// Every known node id, in ascending XOR distance to `target`. Ties
    /// (which cannot occur among distinct ids, since XOR distance to a fixed
    /// target is injective) are broken by raw XOR value as a tiebreaker for
    /// determinism regardless.
    pub fn iter_closest(&self, target: NodeId) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .collect();
        all.sort_by_key(|id| *id ^ target);
        all
    }

    /// Every known id across all buckets, in randomized order. Used to
    /// schedule aging probes without favoring any particular bucket.
    pub fn iter_all_random(&self) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .collect();
        all.shuffle(&mut rand::thread_rng());
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;

    fn id_at_bucket(local: NodeId, bucket: usize) -> NodeId {
        // Flips the bit `bucket` positions up from the LSB, so the only set
        // bit in the xor distance is that one and the node lands exactly in
        // `get_nodes_at_log_distance(bucket + 1)`.
        let mut bytes = local.to_fixed_bytes();
        let byte_idx = 31 - bucket / 8;
        let bit_idx = bucket % 8;
        bytes[byte_idx] ^= 1 << bit_idx;
        H256::from(bytes)
    }

    #[test]
    fn local_id_is_never_stored() {
        let local = H256::random();
        let mut table = RoutingTable::new(local);
        assert_eq!(table.update(local), None);
        assert!(!table.contains(local));
    }

    #[test]
    fn update_appends_until_full_then_replaces() {
        let local = H256::zero();
        let mut table = RoutingTable::with_bucket_size(local, 2);
        let a = id_at_bucket(local, 255);
        let b_bytes = {
            let mut bytes = a.to_fixed_bytes();
            bytes[31] ^= 0b0000_0010;
            bytes
        };
        let b = H256::from(b_bytes);
        let c_bytes = {
            let mut bytes = a.to_fixed_bytes();
            bytes[31] ^= 0b0000_0100;
            bytes
        };
        let c = H256::from(c_bytes);

        assert_eq!(table.update(a), None);
        assert_eq!(table.update(b), None);
        // Bucket (size 2) is now full; the next insert in the same bucket
        // goes to the replacement cache and evicts `a`, the bucket head.
        let evicted = table.update(c);
        assert_eq!(evicted, Some(a));
        assert_eq!(table.get_nodes_at_log_distance(256), vec![a, b]);
    }

    #[test]
    fn re_witnessing_moves_to_tail() {
        let local = H256::zero();
        let mut table = RoutingTable::with_bucket_size(local, 16);
        let a = id_at_bucket(local, 10);
        let b_bytes = {
            let mut bytes = a.to_fixed_bytes();
            bytes[30] ^= 0b0000_0001;
            bytes
        };
        let b = H256::from(b_bytes);
        table.update(a);
        table.update(b);
        assert_eq!(table.get_nodes_at_log_distance(11), vec![a, b]);
        table.update(a);
        assert_eq!(table.get_nodes_at_log_distance(11), vec![b, a]);
    }

    #[test]
    fn remove_promotes_replacement() {
        let local = H256::zero();
        let mut table = RoutingTable::with_bucket_size(local, 1);
        let a = id_at_bucket(local, 255);
        let b_bytes = {
            let mut bytes = a.to_fixed_bytes();
            bytes[31] ^= 0b0000_0010;
            bytes
        };
        let b = H256::from(b_bytes);

        table.update(a);
        let evicted = table.update(b);
        assert_eq!(evicted, Some(a));

        table.remove(a);
        assert_eq!(table.get_nodes_at_log_distance(256), vec![b]);
    }

    #[test]
    fn iter_closest_is_sorted_ascending() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);
        let far = id_at_bucket(local, 255);
        let near = id_at_bucket(local, 0);
        table.update(far);
        table.update(near);
        let closest = table.iter_closest(local);
        assert_eq!(closest, vec![near, far]);
    }

    #[test]
    fn iter_all_random_yields_every_node() {
        let local = H256::zero();
        let mut table = RoutingTable::new(local);
        let ids: Vec<NodeId> = (0..8).map(|b| id_at_bucket(local, b * 30)).collect();
        for id in &ids {
            table.update(*id);
        }
        let mut shuffled = table.iter_all_random();
        shuffled.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(shuffled, expected);
    }
}
