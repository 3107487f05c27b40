use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::identity::NodeId;

/// One contiguous layer range of a model, assigned to a host.
///
/// The shards of a model partition `[0, total_layers)` exactly: ranges are
/// inclusive on both ends, adjacent, and non-overlapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelShard {
    pub shard_id: String,
    pub model_id: String,
    /// First layer in this shard
    pub layer_start: usize,
    /// Last layer in this shard, inclusive
    pub layer_end: usize,
    /// Estimated weight size in megabytes
    pub size_mb: f64,
    /// Short content tag used to detect plan mismatches between peers
    pub checksum: String,
}

impl ModelShard {
    pub fn layer_count(&self) -> usize {
        self.layer_end - self.layer_start + 1
    }
}

/// A complete sharding plan for one model: the shards in pipeline order and
/// the replica placement chosen for each shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPlan {
    pub model_id: String,
    pub total_layers: usize,
    /// Shards ascending by `layer_start`
    pub shards: Vec<ModelShard>,
    /// Replica hosts per shard id, best quality first
    pub placements: HashMap<String, Vec<NodeId>>,
}

impl ShardPlan {
    /// Replica hosts for a shard, empty if the shard has no placement.
    pub fn hosts(&self, shard_id: &str) -> &[NodeId] {
        self.placements
            .get(shard_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Local registry of sharding plans, keyed by model id.
///
/// A model with a registered plan is coordinated as a pipeline; without one
/// it falls back to whole-model replication.
#[derive(Debug, Default)]
pub struct ShardStore {
    plans: HashMap<String, ShardPlan>,
}

impl ShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plan: ShardPlan) {
        tracing::info!(
            model_id = %plan.model_id,
            shards = plan.shards.len(),
            "sharding plan registered"
        );
        self.plans.insert(plan.model_id.clone(), plan);
    }

    pub fn get(&self, model_id: &str) -> Option<&ShardPlan> {
        self.plans.get(model_id)
    }

    pub fn remove(&mut self, model_id: &str) -> Option<ShardPlan> {
        self.plans.remove(model_id)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
