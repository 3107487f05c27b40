use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::{NodeCapability, NodeType};
use crate::errors::{P2pError, Result};
use crate::identity::NodeId;

/// Node configuration: identity, capability profile, and protocol tunables.
///
/// Serialized to TOML at `~/.swarm-infer/node.toml`. Every tunable has a
/// default so a config containing only `node_id` and `node_type` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier, unique network-wide
    pub node_id: NodeId,

    /// Role this node plays in the mesh
    pub node_type: NodeType,

    /// Models hosted locally
    #[serde(default)]
    pub models: BTreeSet<String>,

    /// Relative throughput estimate
    #[serde(default = "default_compute_power")]
    pub compute_power: f64,

    /// Available memory in gigabytes
    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,

    /// Network bandwidth estimate in megabits per second
    #[serde(default = "default_bandwidth_mbps")]
    pub bandwidth_mbps: f64,

    /// Whether a GPU is available for inference
    #[serde(default)]
    pub gpu_available: bool,

    /// Maximum entries per DHT k-bucket
    #[serde(default = "default_k_bucket_size")]
    pub k_bucket_size: usize,

    /// Seconds between heartbeat broadcasts
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Seconds between maintenance passes (stale eviction, cache sweep)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Seconds of silence after which a peer is considered stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Seconds a message id stays in the de-duplication cache
    #[serde(default = "default_message_cache_ttl_secs")]
    pub message_cache_ttl_secs: u64,

    /// Hop budget for gossiped messages
    #[serde(default = "default_message_ttl")]
    pub default_message_ttl: u32,

    /// Peer count at which connectivity is considered healthy
    #[serde(default = "default_target_peer_count")]
    pub target_peer_count: usize,

    /// Independent replicas requested for non-sharded inference
    #[serde(default = "default_redundancy")]
    pub default_redundancy: usize,

    /// Fraction of faulty responders tolerated by consensus
    #[serde(default = "default_byzantine_tolerance")]
    pub byzantine_tolerance: f64,

    /// Relative difference under which numeric results count as equal
    #[serde(default = "default_numeric_tolerance")]
    pub numeric_tolerance: f64,
}

fn default_compute_power() -> f64 {
    1.0
}
fn default_memory_gb() -> f64 {
    8.0
}
fn default_bandwidth_mbps() -> f64 {
    100.0
}
fn default_k_bucket_size() -> usize {
    20
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_maintenance_interval_secs() -> u64 {
    60
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_message_cache_ttl_secs() -> u64 {
    3600
}
fn default_message_ttl() -> u32 {
    10
}
fn default_target_peer_count() -> usize {
    10
}
fn default_redundancy() -> usize {
    3
}
fn default_byzantine_tolerance() -> f64 {
    1.0 / 3.0
}
fn default_numeric_tolerance() -> f64 {
    0.01
}

impl NodeConfig {
    /// Generate a configuration with a fresh random node id.
    pub fn generate(node_type: NodeType) -> Self {
        Self::named(NodeId::random(), node_type)
    }

    /// Build a configuration for a known node id with all defaults.
    pub fn named(node_id: NodeId, node_type: NodeType) -> Self {
        Self {
            node_id,
            node_type,
            models: BTreeSet::new(),
            compute_power: default_compute_power(),
            memory_gb: default_memory_gb(),
            bandwidth_mbps: default_bandwidth_mbps(),
            gpu_available: false,
            k_bucket_size: default_k_bucket_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            message_cache_ttl_secs: default_message_cache_ttl_secs(),
            default_message_ttl: default_message_ttl(),
            target_peer_count: default_target_peer_count(),
            default_redundancy: default_redundancy(),
            byzantine_tolerance: default_byzantine_tolerance(),
            numeric_tolerance: default_numeric_tolerance(),
        }
    }

    /// The capability profile this node announces to the network.
    pub fn capability(&self) -> NodeCapability {
        NodeCapability::new(self.node_id.clone(), self.node_type)
            .with_models(self.models.iter().cloned())
            .with_compute_power(self.compute_power)
            .with_memory_gb(self.memory_gb)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn message_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.message_cache_ttl_secs)
    }

    /// Default configuration file path: `~/.swarm-infer/node.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| P2pError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".swarm-infer").join("node.toml"))
    }

    /// Save configuration to file.
    ///
    /// Creates parent directories as needed and writes atomically
    /// (temp file + rename) so a crash cannot leave a truncated config.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(path = %parent.display(), error = %e, "failed to create config directory");
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string)?;
        fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "node configuration saved");
        Ok(())
    }

    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to read config file");
            e
        })?;

        let config: Self = toml::from_str(&content)?;

        tracing::info!(
            path = %path.display(),
            node_id = %config.node_id,
            "node configuration loaded"
        );

        Ok(config)
    }
}
