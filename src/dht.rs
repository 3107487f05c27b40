//! Kademlia-flavored routing and capability table.
//!
//! Peers are filed into 64 k-buckets by the most significant bit of the XOR
//! distance between their 64-bit key and the local node's key. Each bucket
//! holds at most `k` entries, most recently seen first. Alongside routing,
//! the table keeps the full [`NodeCapability`] profile per known peer and a
//! small key-value store for network metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::capability::{unix_now, NodeCapability};
use crate::identity::NodeId;

/// Number of k-buckets, one per possible MSB position of a 64-bit distance.
pub const BUCKET_COUNT: usize = 64;

/// A value stored in the distributed hash table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Value,
    pub timestamp: u64,
    pub stored_by: NodeId,
}

/// Local view of the routing table and peer capabilities.
pub struct Dht {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Vec<NodeId>>,
    node_info: HashMap<NodeId, NodeCapability>,
    data: HashMap<String, StoredValue>,
}

impl Dht {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![Vec::new(); BUCKET_COUNT],
            node_info: HashMap::new(),
            data: HashMap::new(),
        }
    }

    /// Bucket index for a nonzero distance: the position of its highest set bit.
    fn bucket_index(distance: u64) -> usize {
        debug_assert_ne!(distance, 0);
        63 - distance.leading_zeros() as usize
    }

    /// Insert or refresh a peer.
    ///
    /// Known peers move to the front of their bucket (most recently seen
    /// first). A new peer landing in a full bucket pushes out the oldest
    /// entries, which are dropped from `node_info` too, so the table stays
    /// bounded while fresh peers stay routable.
    pub fn add_node(&mut self, capability: NodeCapability) -> bool {
        let node_id = capability.node_id.clone();
        if node_id == self.local_id {
            return false;
        }

        let distance = self.local_id.distance(&node_id);
        if distance == 0 {
            // Key collision with ourselves; refuse rather than misroute.
            tracing::warn!(node_id = %node_id, "peer key collides with local key, ignoring");
            return false;
        }

        let bucket = &mut self.buckets[Self::bucket_index(distance)];

        if let Some(pos) = bucket.iter().position(|id| *id == node_id) {
            bucket.remove(pos);
        }
        bucket.insert(0, node_id.clone());

        while bucket.len() > self.k {
            if let Some(evicted) = bucket.pop() {
                self.node_info.remove(&evicted);
                tracing::debug!(node_id = %evicted, "bucket full, oldest peer evicted");
            }
        }

        self.node_info.insert(node_id, capability);
        true
    }

    /// Remove a peer from routing and the capability table.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Option<NodeCapability> {
        let distance = self.local_id.distance(node_id);
        if distance != 0 {
            let bucket = &mut self.buckets[Self::bucket_index(distance)];
            bucket.retain(|id| id != node_id);
        }
        self.node_info.remove(node_id)
    }

    /// Refresh a peer's liveness timestamp and bucket position.
    pub fn touch(&mut self, node_id: &NodeId, now: u64) -> bool {
        match self.node_info.get_mut(node_id) {
            Some(info) => {
                info.touch(now);
                let distance = self.local_id.distance(node_id);
                let bucket = &mut self.buckets[Self::bucket_index(distance)];
                if let Some(pos) = bucket.iter().position(|id| id == node_id) {
                    let id = bucket.remove(pos);
                    bucket.insert(0, id);
                }
                true
            }
            None => false,
        }
    }

    pub fn get_node(&self, node_id: &NodeId) -> Option<&NodeCapability> {
        self.node_info.get(node_id)
    }

    pub fn get_node_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeCapability> {
        self.node_info.get_mut(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.node_info.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeCapability> {
        self.node_info.values()
    }

    /// Record a model announcement for an already-known peer.
    pub fn add_model_to_node(&mut self, node_id: &NodeId, model_id: &str) -> bool {
        match self.node_info.get_mut(node_id) {
            Some(info) => {
                info.models.insert(model_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Decay a peer's reliability score after a failed dispatch.
    pub fn record_failure(&mut self, node_id: &NodeId) {
        if let Some(info) = self.node_info.get_mut(node_id) {
            info.record_failure();
            tracing::debug!(
                node_id = %node_id,
                reliability = info.reliability_score,
                "reliability decayed after dispatch failure"
            );
        }
    }

    /// Up to `count` known peers closest to `target` by XOR distance.
    ///
    /// Scans outward from the target's bucket, then sorts candidates by exact
    /// distance so the result is correct even when buckets are sparse.
    pub fn find_closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeCapability> {
        let target_key = target.key();
        let distance = self.local_id.distance(target);
        let start = if distance == 0 {
            0
        } else {
            Self::bucket_index(distance)
        };

        let mut candidates: Vec<&NodeId> = self.buckets[start].iter().collect();
        for offset in 1..BUCKET_COUNT {
            if let Some(below) = start.checked_sub(offset) {
                candidates.extend(self.buckets[below].iter());
            }
            if let Some(bucket) = self.buckets.get(start + offset) {
                candidates.extend(bucket.iter());
            }
            if candidates.len() >= count * 2 {
                break;
            }
        }

        let mut with_distance: Vec<(u64, &NodeId)> = candidates
            .into_iter()
            .map(|id| (id.key() ^ target_key, id))
            .collect();
        with_distance.sort_by_key(|(d, _)| *d);

        with_distance
            .into_iter()
            .take(count)
            .filter_map(|(_, id)| self.node_info.get(id).cloned())
            .collect()
    }

    /// Live peers advertising `model_id`, best quality first.
    pub fn find_nodes_with_model(
        &self,
        model_id: &str,
        now: u64,
        stale_after_secs: u64,
    ) -> Vec<NodeCapability> {
        let mut hosts: Vec<NodeCapability> = self
            .node_info
            .values()
            .filter(|info| info.hosts_model(model_id) && !info.is_stale(now, stale_after_secs))
            .cloned()
            .collect();
        hosts.sort_by(crate::capability::quality_ordering);
        hosts
    }

    /// Peers that have been quiet past the staleness window.
    pub fn stale_nodes(&self, now: u64, stale_after_secs: u64) -> Vec<NodeId> {
        self.node_info
            .values()
            .filter(|info| info.is_stale(now, stale_after_secs))
            .map(|info| info.node_id.clone())
            .collect()
    }

    /// Store a value under a key, stamped with the local node and time.
    pub fn store_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(
            key.into(),
            StoredValue {
                value,
                timestamp: unix_now(),
                stored_by: self.local_id.clone(),
            },
        );
    }

    pub fn get_data(&self, key: &str) -> Option<&StoredValue> {
        self.data.get(key)
    }
}
