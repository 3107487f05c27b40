//! Advertised peer capability profiles.
//!
//! Every node announces a [`NodeCapability`] when joining the network and
//! refreshes it with heartbeats. The DHT keeps one profile per known peer and
//! evicts it when the peer goes quiet past the staleness window.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::NodeId;

/// Multiplier applied to `reliability_score` on each recorded dispatch failure.
pub const RELIABILITY_DECAY: f64 = 0.9;

/// Lower bound the reliability score never decays below.
pub const RELIABILITY_FLOOR: f64 = 0.05;

/// Number of distinct node roles, used by the health score diversity factor.
pub const NODE_TYPE_COUNT: usize = 4;

/// Role a peer plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Full inference plus coordination.
    Full,
    /// Inference only.
    Compute,
    /// Coordination only, no local model execution.
    Coordinator,
    /// External API gateway.
    Gateway,
}

/// One peer's advertised profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapability {
    /// Stable opaque identifier, unique network-wide
    pub node_id: NodeId,

    /// Role this node plays in the mesh
    pub node_type: NodeType,

    /// Model identifiers hosted by this node
    pub models: BTreeSet<String>,

    /// Relative throughput estimate
    pub compute_power: f64,

    /// Available memory in gigabytes
    pub memory_gb: f64,

    /// Network bandwidth estimate in megabits per second
    pub bandwidth_mbps: f64,

    /// Whether a GPU is available for inference
    pub gpu_available: bool,

    /// Score in [0, 1]; starts at 1.0 and decays with dispatch failures
    pub reliability_score: f64,

    /// Unix timestamp of the last message received from this peer
    pub last_seen: u64,
}

impl NodeCapability {
    /// Create a profile with neutral hardware defaults.
    pub fn new(node_id: NodeId, node_type: NodeType) -> Self {
        Self {
            node_id,
            node_type,
            models: BTreeSet::new(),
            compute_power: 1.0,
            memory_gb: 8.0,
            bandwidth_mbps: 100.0,
            gpu_available: false,
            reliability_score: 1.0,
            last_seen: unix_now(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compute_power(mut self, compute_power: f64) -> Self {
        self.compute_power = compute_power;
        self
    }

    pub fn with_memory_gb(mut self, memory_gb: f64) -> Self {
        self.memory_gb = memory_gb;
        self
    }

    pub fn hosts_model(&self, model_id: &str) -> bool {
        self.models.contains(model_id)
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Decay the reliability score after a failed dispatch.
    pub fn record_failure(&mut self) {
        self.reliability_score = (self.reliability_score * RELIABILITY_DECAY).max(RELIABILITY_FLOOR);
    }

    /// Whether the peer has been quiet longer than the staleness window.
    pub fn is_stale(&self, now: u64, stale_after_secs: u64) -> bool {
        now.saturating_sub(self.last_seen) > stale_after_secs
    }
}

/// Descending order by `(reliability_score, compute_power)`.
///
/// Used everywhere a "best node first" ranking is needed: shard placement,
/// pipeline stage assignment, and replica selection.
pub fn quality_ordering(a: &NodeCapability, b: &NodeCapability) -> Ordering {
    b.reliability_score
        .partial_cmp(&a.reliability_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.compute_power
                .partial_cmp(&a.compute_power)
                .unwrap_or(Ordering::Equal)
        })
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
