//! Compute-proportional layer sharding and replica placement.
//!
//! Layers are split across candidate nodes in proportion to advertised
//! compute power. The partition is always exact: every layer lands in
//! exactly one shard and the final shard absorbs rounding remainder.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::capability::{quality_ordering, unix_now, NodeCapability};
use crate::errors::{P2pError, Result};
use crate::identity::NodeId;
use crate::model::shard::ModelShard;

/// Estimated weight size per layer in megabytes.
pub const SIZE_MB_PER_LAYER: f64 = 10.0;

/// Replica hosts chosen per shard.
pub const PLACEMENT_REPLICAS: usize = 3;

/// A host must have this much headroom over the shard's estimated size.
pub const MEMORY_HEADROOM: f64 = 1.5;

/// Split `total_layers` across `nodes` in proportion to compute power.
///
/// Faster nodes get proportionally more layers, every chosen node gets at
/// least one, and shards are returned ascending by `layer_start`. At most
/// `total_layers` nodes participate.
pub fn create_sharding_plan(
    model_id: &str,
    total_layers: usize,
    nodes: &[NodeCapability],
) -> Result<Vec<ModelShard>> {
    if nodes.is_empty() {
        return Err(P2pError::Planning(format!(
            "no candidate nodes to shard model {model_id}"
        )));
    }
    if total_layers == 0 {
        return Err(P2pError::Planning(format!(
            "model {model_id} has zero layers"
        )));
    }

    let mut ranked: Vec<&NodeCapability> = nodes.iter().collect();
    ranked.sort_by(|a, b| {
        b.compute_power
            .partial_cmp(&a.compute_power)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(total_layers);

    let total_power: f64 = ranked.iter().map(|n| n.compute_power).sum();
    if total_power <= 0.0 {
        return Err(P2pError::Planning(format!(
            "candidate nodes for model {model_id} advertise zero compute"
        )));
    }

    let mut shards = Vec::with_capacity(ranked.len());
    let mut next_layer = 0usize;

    for (index, node) in ranked.iter().enumerate() {
        let remaining_layers = total_layers - next_layer;
        let remaining_nodes = ranked.len() - index;

        let layers = if remaining_nodes == 1 {
            // Last shard absorbs the rounding remainder.
            remaining_layers
        } else {
            let ideal =
                (total_layers as f64 * node.compute_power / total_power).floor() as usize;
            // Leave at least one layer for every node still waiting.
            ideal.max(1).min(remaining_layers - (remaining_nodes - 1))
        };

        let layer_start = next_layer;
        let layer_end = layer_start + layers - 1;
        next_layer = layer_end + 1;

        shards.push(ModelShard {
            shard_id: format!("{model_id}-shard-{index}"),
            model_id: model_id.to_string(),
            layer_start,
            layer_end,
            size_mb: layers as f64 * SIZE_MB_PER_LAYER,
            checksum: shard_checksum(model_id, layer_start, layers),
        });
    }

    debug_assert_eq!(next_layer, total_layers);
    tracing::debug!(
        model_id,
        total_layers,
        shards = shards.len(),
        "sharding plan created"
    );

    Ok(shards)
}

/// Choose up to [`PLACEMENT_REPLICAS`] hosts per shard.
///
/// Candidates need `memory_gb × 1024 ≥ size_mb × 1.5`; survivors are ranked
/// best quality first. A shard no candidate can hold gets an empty list.
pub fn optimize_shard_placement(
    shards: &[ModelShard],
    nodes: &[NodeCapability],
) -> HashMap<String, Vec<NodeId>> {
    let mut placements = HashMap::with_capacity(shards.len());

    for shard in shards {
        let mut fits: Vec<&NodeCapability> = nodes
            .iter()
            .filter(|n| n.memory_gb * 1024.0 >= shard.size_mb * MEMORY_HEADROOM)
            .collect();
        fits.sort_by(|a, b| quality_ordering(a, b));

        let hosts: Vec<NodeId> = fits
            .into_iter()
            .take(PLACEMENT_REPLICAS)
            .map(|n| n.node_id.clone())
            .collect();

        if hosts.is_empty() {
            tracing::warn!(shard_id = %shard.shard_id, size_mb = shard.size_mb, "no node can host shard");
        }
        placements.insert(shard.shard_id.clone(), hosts);
    }

    placements
}

/// Short content tag for a shard: first 16 hex chars of a SHA-256 over the
/// model id, layer range, and creation time. Only compared for equality.
pub fn shard_checksum(model_id: &str, layer_start: usize, layer_count: usize) -> String {
    let material = format!("{model_id}:{layer_start}:{layer_count}:{}", unix_now());
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)[..16].to_string()
}
