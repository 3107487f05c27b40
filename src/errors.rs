use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NodeId;

/// Errors that can occur in the node's infrastructure layer.
#[derive(Error, Debug)]
pub enum P2pError {
    /// IO error occurred (file operations, config storage, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error (CBOR envelopes, TOML config)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error (peer unreachable, send failed, reply lost)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Shard planning error (no candidates, zero layers, zero compute)
    #[error("Planning error: {0}")]
    Planning(String),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, P2pError>;

impl From<toml::ser::Error> for P2pError {
    fn from(e: toml::ser::Error) -> Self {
        P2pError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for P2pError {
    fn from(e: toml::de::Error) -> Self {
        P2pError::Serialization(e.to_string())
    }
}

/// Typed failure of one coordinated inference task.
///
/// These are normal network conditions reported back to the caller inside an
/// [`InferenceReport`](crate::inference::task::InferenceReport), never raised
/// as a hard `Err` by the coordinator. `ConsensusNotReached` in particular is
/// a legitimate outcome of a healthy network, not a bug.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskError {
    /// No peer advertises the requested model.
    #[error("no nodes available for model {model_id}")]
    NoNodesAvailable { model_id: String },

    /// No live replica holds a shard required by the pipeline plan.
    #[error("no node holds shard {shard_id}")]
    ShardUnavailable { shard_id: String },

    /// A pipeline stage's remote call failed; the task is aborted immediately.
    #[error("pipeline stage {stage} failed on node {node_id}: {reason}")]
    StageFailure {
        stage: usize,
        node_id: NodeId,
        reason: String,
    },

    /// Replicas answered but no result cluster met the agreement threshold.
    #[error("no agreement among {responses} responses")]
    ConsensusNotReached { responses: usize },

    /// The task deadline passed before any usable result arrived.
    #[error("task deadline exceeded")]
    Timeout,

    /// Opaque failure from the transport boundary.
    #[error("transport failure: {detail}")]
    Transport { detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = P2pError::Config("missing node_id".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing node_id");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: P2pError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_task_error_serde_roundtrip() {
        let err = TaskError::StageFailure {
            stage: 2,
            node_id: NodeId::new("worker-7"),
            reason: "connection reset".to_string(),
        };

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("stage-failure"));

        let decoded: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_task_error_display() {
        let err = TaskError::NoNodesAvailable {
            model_id: "sentiment-v2".to_string(),
        };
        assert_eq!(err.to_string(), "no nodes available for model sentiment-v2");
    }
}
