//! Wire envelopes and message payloads.
//!
//! Every message travels inside an [`Envelope`] carrying routing metadata:
//! a unique id for de-duplication, a TTL hop budget, and the path of nodes
//! already visited. Envelopes are CBOR on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capability::{unix_now, NodeCapability};
use crate::errors::{P2pError, Result};
use crate::identity::NodeId;

/// Default hop budget for gossiped messages.
pub const DEFAULT_TTL: u32 = 10;

/// Message body, one variant per protocol message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    /// Capability announcement, gossiped on join and on change.
    NodeAnnounce { capability: NodeCapability },
    /// Directed request for known peers.
    NodeQuery { count: usize },
    /// Directed reply to a `NodeQuery`.
    NodeResponse { peers: Vec<NodeCapability> },
    /// A node started hosting a model, gossiped network-wide.
    ModelAnnounce {
        model_id: String,
        host: NodeId,
        model_info: Value,
    },
    /// Directed request for a model's metadata.
    ModelRequest { model_id: String },
    /// Directed request to run one model (or shard) on one input.
    InferenceRequest {
        request_id: Uuid,
        task_id: Uuid,
        model_id: String,
        shard_id: Option<String>,
        input: Value,
    },
    /// Directed reply carrying the execution outcome.
    InferenceResponse {
        request_id: Uuid,
        task_id: Uuid,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Periodic liveness beacon, gossiped.
    Heartbeat { load: f64, active_inferences: usize },
    /// Topology delta, gossiped.
    NetworkUpdate {
        known_nodes: usize,
        departed: Vec<NodeId>,
    },
}

impl Payload {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::NodeAnnounce { .. } => "node-announce",
            Payload::NodeQuery { .. } => "node-query",
            Payload::NodeResponse { .. } => "node-response",
            Payload::ModelAnnounce { .. } => "model-announce",
            Payload::ModelRequest { .. } => "model-request",
            Payload::InferenceRequest { .. } => "inference-request",
            Payload::InferenceResponse { .. } => "inference-response",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::NetworkUpdate { .. } => "network-update",
        }
    }

    /// Whether the payload is gossiped onward; directed request/reply
    /// payloads stop at their recipient.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Payload::NodeAnnounce { .. }
                | Payload::ModelAnnounce { .. }
                | Payload::Heartbeat { .. }
                | Payload::NetworkUpdate { .. }
        )
    }
}

/// One wire message with routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub sender_id: NodeId,
    pub payload: Payload,
    /// Remaining hop budget; a message with 0 is never retransmitted
    pub ttl: u32,
    pub timestamp: u64,
    /// Nodes this message has already visited, originator first
    pub path: Vec<NodeId>,
}

impl Envelope {
    pub fn new(sender_id: NodeId, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            path: vec![sender_id.clone()],
            sender_id,
            payload,
            ttl: DEFAULT_TTL,
            timestamp: unix_now(),
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Append a node to the visited path if not already present.
    pub fn record_hop(&mut self, node_id: &NodeId) {
        if !self.path.contains(node_id) {
            self.path.push(node_id.clone());
        }
    }

    /// CBOR-encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| P2pError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Decode a wire message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| P2pError::Serialization(e.to_string()))
    }
}
