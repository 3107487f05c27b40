use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::capability::unix_now;
use crate::errors::TaskError;
use crate::identity::NodeId;

/// Default wall-clock budget for a coordinated task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// One inference request as submitted to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceTask {
    pub task_id: Uuid,
    pub model_id: String,
    pub input: Value,
    /// Higher runs first when tasks queue; purely advisory today
    pub priority: u8,
    /// Wall-clock budget covering planning, dispatch, and gather
    pub timeout: Duration,
    /// Independent replicas requested for non-sharded execution
    pub redundancy: usize,
    pub created_at: u64,
    /// Node that submitted the task
    pub client_id: NodeId,
}

impl InferenceTask {
    pub fn new(model_id: impl Into<String>, input: Value, client_id: NodeId) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            model_id: model_id.into(),
            input,
            priority: 0,
            timeout: DEFAULT_TASK_TIMEOUT,
            redundancy: 3,
            created_at: unix_now(),
            client_id,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy.max(1);
        self
    }
}

/// Lifecycle of a coordinated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Looking up hosts and building an execution plan
    Planning,
    /// Work sent to the chosen nodes
    Dispatched,
    /// Waiting for replies within the deadline
    Collecting,
    /// Replicated results agreed
    ConsensusReached,
    /// Replies arrived but no cluster met the agreement threshold
    NoConsensus,
    /// Task failed before producing a usable result
    Failed,
}

impl TaskState {
    /// Whether the task can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Planning | TaskState::Dispatched | TaskState::Collecting
        )
    }
}

/// Final outcome of one coordinated task, always returned to the caller.
///
/// Network-level failures land in `error` rather than a hard `Err`; the
/// coordinator reserves `Err` for local infrastructure problems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReport {
    pub task_id: Uuid,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    /// Nodes that contributed to the final result
    pub nodes_used: Vec<NodeId>,
    /// True only when multiple replicas agreed through consensus
    pub consensus_reached: bool,
    pub execution_time_ms: u64,
}

impl InferenceReport {
    pub fn failure(task_id: Uuid, error: TaskError, execution_time_ms: u64) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error),
            nodes_used: Vec::new(),
            consensus_reached: false,
            execution_time_ms,
        }
    }
}
