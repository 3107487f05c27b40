//! Task planning and execution across the mesh.
//!
//! The coordinator resolves a task to an execution plan — a layer pipeline
//! when a sharding plan is registered for the model, whole-model replication
//! otherwise — drives the dispatches, and folds the outcome into an
//! [`InferenceReport`]. Network-level failures are reported, never raised:
//! the caller always gets a report back.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::capability::{quality_ordering, unix_now, NodeCapability};
use crate::dht::Dht;
use crate::errors::{Result, TaskError};
use crate::identity::NodeId;
use crate::inference::consensus::{ConsensusEngine, ConsensusOutcome};
use crate::inference::task::{InferenceReport, InferenceTask, TaskState};
use crate::model::shard::ShardStore;

/// One remote (or local) execution of a model or shard on one input.
///
/// Implemented over the message substrate by the network manager, and by
/// scripted fakes in tests.
#[async_trait]
pub trait ShardDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        target: &NodeId,
        task_id: Uuid,
        model_id: &str,
        shard_id: Option<&str>,
        input: &Value,
        timeout: Duration,
    ) -> Result<Value>;
}

/// One stage of a pipeline plan.
#[derive(Debug, Clone)]
struct PipelineStage {
    shard_id: String,
    node_id: NodeId,
}

#[derive(Debug, Clone)]
enum ExecutionPlan {
    /// Sequential stages, output feeding input, ascending by layer range.
    Pipeline(Vec<PipelineStage>),
    /// Independent whole-model replicas.
    Replication(Vec<NodeId>),
}

pub struct InferenceCoordinator {
    local_id: NodeId,
    dht: Arc<RwLock<Dht>>,
    shards: Arc<RwLock<ShardStore>>,
    consensus: ConsensusEngine,
    dispatcher: Arc<dyn ShardDispatcher>,
    stale_after_secs: u64,
    active: RwLock<HashMap<Uuid, TaskState>>,
}

impl InferenceCoordinator {
    pub fn new(
        local_id: NodeId,
        dht: Arc<RwLock<Dht>>,
        shards: Arc<RwLock<ShardStore>>,
        consensus: ConsensusEngine,
        dispatcher: Arc<dyn ShardDispatcher>,
        stale_after_secs: u64,
    ) -> Self {
        Self {
            local_id,
            dht,
            shards,
            consensus,
            dispatcher,
            stale_after_secs,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Tasks currently in flight.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Run one task to completion and report the outcome.
    pub async fn coordinate(&self, task: InferenceTask) -> InferenceReport {
        let started = Instant::now();
        let deadline = started + task.timeout;
        self.set_state(task.task_id, TaskState::Planning).await;

        tracing::info!(
            task_id = %task.task_id,
            model_id = %task.model_id,
            redundancy = task.redundancy,
            "coordinating inference task"
        );

        let report = match self.build_plan(&task).await {
            Ok(ExecutionPlan::Pipeline(stages)) => {
                self.run_pipeline(&task, stages, deadline).await
            }
            Ok(ExecutionPlan::Replication(nodes)) => {
                self.run_replicated(&task, nodes, deadline).await
            }
            Err(error) => {
                self.set_state(task.task_id, TaskState::Failed).await;
                InferenceReport::failure(task.task_id, error, elapsed_ms(started))
            }
        };

        self.active.write().await.remove(&task.task_id);

        if report.success {
            tracing::info!(
                task_id = %task.task_id,
                nodes = report.nodes_used.len(),
                consensus = report.consensus_reached,
                elapsed_ms = report.execution_time_ms,
                "inference task completed"
            );
        } else {
            tracing::warn!(
                task_id = %task.task_id,
                error = ?report.error,
                elapsed_ms = report.execution_time_ms,
                "inference task failed"
            );
        }

        report
    }

    async fn set_state(&self, task_id: Uuid, state: TaskState) {
        self.active.write().await.insert(task_id, state);
    }

    /// Resolve the task to a pipeline or replication plan.
    async fn build_plan(
        &self,
        task: &InferenceTask,
    ) -> std::result::Result<ExecutionPlan, TaskError> {
        let now = unix_now();

        if let Some(plan) = self.shards.read().await.get(&task.model_id).cloned() {
            let dht = self.dht.read().await;
            let mut stages = Vec::with_capacity(plan.shards.len());

            for shard in &plan.shards {
                let best = plan
                    .hosts(&shard.shard_id)
                    .iter()
                    .filter_map(|id| {
                        if *id == self.local_id {
                            // The dispatcher runs local targets through the
                            // executor without touching the network.
                            dht.get_node(id).cloned().or_else(|| {
                                Some(NodeCapability::new(
                                    id.clone(),
                                    crate::capability::NodeType::Full,
                                ))
                            })
                        } else {
                            dht.get_node(id)
                                .filter(|c| !c.is_stale(now, self.stale_after_secs))
                                .cloned()
                        }
                    })
                    .min_by(quality_ordering);

                match best {
                    Some(node) => stages.push(PipelineStage {
                        shard_id: shard.shard_id.clone(),
                        node_id: node.node_id,
                    }),
                    None => {
                        return Err(TaskError::ShardUnavailable {
                            shard_id: shard.shard_id.clone(),
                        })
                    }
                }
            }

            return Ok(ExecutionPlan::Pipeline(stages));
        }

        let hosts = self
            .dht
            .read()
            .await
            .find_nodes_with_model(&task.model_id, now, self.stale_after_secs);

        if hosts.is_empty() {
            return Err(TaskError::NoNodesAvailable {
                model_id: task.model_id.clone(),
            });
        }

        let nodes: Vec<NodeId> = hosts
            .into_iter()
            .take(task.redundancy)
            .map(|c| c.node_id)
            .collect();

        Ok(ExecutionPlan::Replication(nodes))
    }

    /// Strictly sequential stage execution. A stage failure aborts the task
    /// immediately; there is no per-stage retry.
    async fn run_pipeline(
        &self,
        task: &InferenceTask,
        stages: Vec<PipelineStage>,
        deadline: Instant,
    ) -> InferenceReport {
        let started = deadline - task.timeout;
        self.set_state(task.task_id, TaskState::Dispatched).await;

        let mut current = task.input.clone();
        let mut nodes_used = Vec::with_capacity(stages.len());

        for (index, stage) in stages.iter().enumerate() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.set_state(task.task_id, TaskState::Failed).await;
                return InferenceReport::failure(
                    task.task_id,
                    TaskError::Timeout,
                    elapsed_ms(started),
                );
            };

            tracing::debug!(
                task_id = %task.task_id,
                stage = index,
                shard_id = %stage.shard_id,
                node_id = %stage.node_id,
                "dispatching pipeline stage"
            );

            match self
                .dispatcher
                .dispatch(
                    &stage.node_id,
                    task.task_id,
                    &task.model_id,
                    Some(&stage.shard_id),
                    &current,
                    remaining,
                )
                .await
            {
                Ok(output) => {
                    nodes_used.push(stage.node_id.clone());
                    current = output;
                }
                Err(err) => {
                    self.dht.write().await.record_failure(&stage.node_id);
                    self.set_state(task.task_id, TaskState::Failed).await;

                    let error = if Instant::now() >= deadline {
                        TaskError::Timeout
                    } else {
                        TaskError::StageFailure {
                            stage: index,
                            node_id: stage.node_id.clone(),
                            reason: err.to_string(),
                        }
                    };
                    return InferenceReport::failure(task.task_id, error, elapsed_ms(started));
                }
            }
        }

        self.set_state(task.task_id, TaskState::ConsensusReached)
            .await;
        InferenceReport {
            task_id: task.task_id,
            success: true,
            result: Some(current),
            error: None,
            nodes_used,
            consensus_reached: false,
            execution_time_ms: elapsed_ms(started),
        }
    }

    /// Concurrent replica dispatch with a deadline-bounded gather. Stragglers
    /// past the deadline are excluded silently; a single responder is used
    /// directly without invoking consensus.
    async fn run_replicated(
        &self,
        task: &InferenceTask,
        nodes: Vec<NodeId>,
        deadline: Instant,
    ) -> InferenceReport {
        use futures::stream::{FuturesUnordered, StreamExt};

        let started = deadline - task.timeout;
        self.set_state(task.task_id, TaskState::Dispatched).await;

        let mut in_flight: FuturesUnordered<_> = nodes
            .iter()
            .map(|node_id| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let node_id = node_id.clone();
                let input = task.input.clone();
                let model_id = task.model_id.clone();
                let task_id = task.task_id;
                let budget = deadline.saturating_duration_since(Instant::now());
                async move {
                    let outcome = dispatcher
                        .dispatch(&node_id, task_id, &model_id, None, &input, budget)
                        .await;
                    (node_id, outcome)
                }
            })
            .collect();

        self.set_state(task.task_id, TaskState::Collecting).await;

        let mut responses: Vec<(NodeId, Value)> = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline.into(), in_flight.next()).await {
                Ok(Some((node_id, Ok(value)))) => responses.push((node_id, value)),
                Ok(Some((node_id, Err(err)))) => {
                    tracing::debug!(
                        task_id = %task.task_id,
                        node_id = %node_id,
                        error = %err,
                        "replica dispatch failed"
                    );
                    self.dht.write().await.record_failure(&node_id);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        task_id = %task.task_id,
                        pending = in_flight.len(),
                        "deadline reached, dropping stragglers"
                    );
                    break;
                }
            }
        }

        match responses.len() {
            0 => {
                self.set_state(task.task_id, TaskState::Failed).await;
                InferenceReport::failure(task.task_id, TaskError::Timeout, elapsed_ms(started))
            }
            1 => {
                let (node_id, value) = responses.into_iter().next().unwrap();
                self.set_state(task.task_id, TaskState::ConsensusReached)
                    .await;
                InferenceReport {
                    task_id: task.task_id,
                    success: true,
                    result: Some(value),
                    error: None,
                    nodes_used: vec![node_id],
                    consensus_reached: false,
                    execution_time_ms: elapsed_ms(started),
                }
            }
            n => match self.consensus.evaluate(&responses) {
                ConsensusOutcome::Agreed { value, supporters } => {
                    self.set_state(task.task_id, TaskState::ConsensusReached)
                        .await;
                    InferenceReport {
                        task_id: task.task_id,
                        success: true,
                        result: Some(value),
                        error: None,
                        nodes_used: supporters,
                        consensus_reached: true,
                        execution_time_ms: elapsed_ms(started),
                    }
                }
                ConsensusOutcome::NotReached { clusters } => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        clusters = ?clusters,
                        "replicas disagree"
                    );
                    self.set_state(task.task_id, TaskState::NoConsensus).await;
                    InferenceReport::failure(
                        task.task_id,
                        TaskError::ConsensusNotReached { responses: n },
                        elapsed_ms(started),
                    )
                }
            },
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NodeType;
    use crate::errors::P2pError;
    use crate::model::shard::{ModelShard, ShardPlan};
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted dispatcher: per-node canned outcomes plus a call log.
    struct FakeDispatcher {
        outcomes: HashMap<NodeId, std::result::Result<Value, String>>,
        delay: Duration,
        calls: Mutex<Vec<(NodeId, Option<String>, Value)>>,
    }

    impl FakeDispatcher {
        fn new() -> Self {
            Self {
                outcomes: HashMap::new(),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn answer(mut self, node: &str, value: Value) -> Self {
            self.outcomes.insert(NodeId::new(node), Ok(value));
            self
        }

        fn fail(mut self, node: &str, reason: &str) -> Self {
            self.outcomes
                .insert(NodeId::new(node), Err(reason.to_string()));
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<(NodeId, Option<String>, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShardDispatcher for FakeDispatcher {
        async fn dispatch(
            &self,
            target: &NodeId,
            _task_id: Uuid,
            _model_id: &str,
            shard_id: Option<&str>,
            input: &Value,
            _timeout: Duration,
        ) -> Result<Value> {
            self.calls.lock().unwrap().push((
                target.clone(),
                shard_id.map(str::to_string),
                input.clone(),
            ));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.outcomes.get(target) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(reason)) => Err(P2pError::Transport(reason.clone())),
                None => Err(P2pError::Transport(format!("no script for {target}"))),
            }
        }
    }

    struct Harness {
        coordinator: InferenceCoordinator,
        dht: Arc<RwLock<Dht>>,
        dispatcher: Arc<FakeDispatcher>,
    }

    async fn harness(dispatcher: FakeDispatcher, hosts: &[(&str, &str)]) -> Harness {
        let dht = Arc::new(RwLock::new(Dht::new(NodeId::new("local"), 20)));
        {
            let mut table = dht.write().await;
            for (node, model) in hosts {
                table.add_node(
                    NodeCapability::new(NodeId::new(*node), NodeType::Compute)
                        .with_models([*model]),
                );
            }
        }

        let dispatcher = Arc::new(dispatcher);
        let coordinator = InferenceCoordinator::new(
            NodeId::new("local"),
            Arc::clone(&dht),
            Arc::new(RwLock::new(ShardStore::new())),
            ConsensusEngine::default(),
            Arc::clone(&dispatcher) as Arc<dyn ShardDispatcher>,
            300,
        );

        Harness {
            coordinator,
            dht,
            dispatcher,
        }
    }

    fn task(model: &str) -> InferenceTask {
        InferenceTask::new(model, json!({"text": "hi"}), NodeId::new("local"))
    }

    #[tokio::test]
    async fn test_no_nodes_available() {
        let h = harness(FakeDispatcher::new(), &[]).await;
        let report = h.coordinator.coordinate(task("m")).await;

        assert!(!report.success);
        assert_eq!(
            report.error,
            Some(TaskError::NoNodesAvailable {
                model_id: "m".to_string()
            })
        );
        assert_eq!(h.coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_replication_reaches_consensus() {
        let dispatcher = FakeDispatcher::new()
            .answer("a", json!(0.90))
            .answer("b", json!(0.903))
            .answer("c", json!(0.2));
        let h = harness(dispatcher, &[("a", "m"), ("b", "m"), ("c", "m")]).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(report.success);
        assert!(report.consensus_reached);
        assert_eq!(report.nodes_used.len(), 2);
    }

    #[tokio::test]
    async fn test_replication_disagreement_reported() {
        let dispatcher = FakeDispatcher::new()
            .answer("a", json!(0.1))
            .answer("b", json!(0.5))
            .answer("c", json!(0.9));
        let h = harness(dispatcher, &[("a", "m"), ("b", "m"), ("c", "m")]).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(!report.success);
        assert_eq!(
            report.error,
            Some(TaskError::ConsensusNotReached { responses: 3 })
        );
    }

    #[tokio::test]
    async fn test_single_responder_skips_consensus() {
        let dispatcher = FakeDispatcher::new().answer("a", json!({"label": "pos"}));
        let h = harness(dispatcher, &[("a", "m")]).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(report.success);
        assert!(!report.consensus_reached);
        assert_eq!(report.result, Some(json!({"label": "pos"})));
        assert_eq!(report.nodes_used, vec![NodeId::new("a")]);
    }

    #[tokio::test]
    async fn test_failed_replica_decays_reliability() {
        let dispatcher = FakeDispatcher::new()
            .answer("a", json!(0.9))
            .answer("b", json!(0.9))
            .fail("c", "connection reset");
        let h = harness(dispatcher, &[("a", "m"), ("b", "m"), ("c", "m")]).await;

        let report = h.coordinator.coordinate(task("m")).await;
        assert!(report.success);

        let table = h.dht.read().await;
        let flaky = table.get_node(&NodeId::new("c")).unwrap();
        assert!((flaky.reliability_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replication_all_failures_times_out() {
        let dispatcher = FakeDispatcher::new()
            .fail("a", "down")
            .fail("b", "down");
        let h = harness(dispatcher, &[("a", "m"), ("b", "m")]).await;

        let report = h.coordinator.coordinate(task("m")).await;
        assert!(!report.success);
        assert_eq!(report.error, Some(TaskError::Timeout));
    }

    #[tokio::test]
    async fn test_replication_deadline_drops_stragglers() {
        let dispatcher = FakeDispatcher::new()
            .answer("a", json!(0.9))
            .with_delay(Duration::from_secs(60));
        let h = harness(dispatcher, &[("a", "m")]).await;

        let report = h
            .coordinator
            .coordinate(task("m").with_timeout(Duration::from_millis(50)))
            .await;

        assert!(!report.success);
        assert_eq!(report.error, Some(TaskError::Timeout));
    }

    async fn register_two_stage_plan(h: &Harness) {
        let plan = ShardPlan {
            model_id: "m".to_string(),
            total_layers: 12,
            shards: vec![
                ModelShard {
                    shard_id: "m-shard-0".to_string(),
                    model_id: "m".to_string(),
                    layer_start: 0,
                    layer_end: 5,
                    size_mb: 60.0,
                    checksum: "aaaa".to_string(),
                },
                ModelShard {
                    shard_id: "m-shard-1".to_string(),
                    model_id: "m".to_string(),
                    layer_start: 6,
                    layer_end: 11,
                    size_mb: 60.0,
                    checksum: "bbbb".to_string(),
                },
            ],
            placements: HashMap::from([
                ("m-shard-0".to_string(), vec![NodeId::new("a")]),
                ("m-shard-1".to_string(), vec![NodeId::new("b")]),
            ]),
        };
        h.coordinator.shards.write().await.register(plan);
    }

    #[tokio::test]
    async fn test_pipeline_runs_stages_in_order() {
        let dispatcher = FakeDispatcher::new()
            .answer("a", json!({"hidden": 1}))
            .answer("b", json!({"final": 2}));
        let h = harness(dispatcher, &[("a", "m"), ("b", "m")]).await;
        register_two_stage_plan(&h).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(report.success);
        assert!(!report.consensus_reached);
        assert_eq!(report.result, Some(json!({"final": 2})));
        assert_eq!(report.nodes_used, vec![NodeId::new("a"), NodeId::new("b")]);

        // Stage 1 received stage 0's output, not the original input.
        let calls = h.dispatcher.calls();
        assert_eq!(calls[0].1.as_deref(), Some("m-shard-0"));
        assert_eq!(calls[1].1.as_deref(), Some("m-shard-1"));
        assert_eq!(calls[1].2, json!({"hidden": 1}));
    }

    #[tokio::test]
    async fn test_pipeline_stage_failure_short_circuits() {
        let dispatcher = FakeDispatcher::new()
            .fail("a", "oom")
            .answer("b", json!({"final": 2}));
        let h = harness(dispatcher, &[("a", "m"), ("b", "m")]).await;
        register_two_stage_plan(&h).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(!report.success);
        match report.error {
            Some(TaskError::StageFailure { stage, node_id, .. }) => {
                assert_eq!(stage, 0);
                assert_eq!(node_id, NodeId::new("a"));
            }
            other => panic!("expected stage failure, got {other:?}"),
        }
        // Stage 1 was never dispatched.
        assert_eq!(h.dispatcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_missing_replica_is_shard_unavailable() {
        let dispatcher = FakeDispatcher::new().answer("a", json!(1));
        // Only node "a" exists; the plan's second stage points at a ghost.
        let h = harness(dispatcher, &[("a", "m")]).await;
        register_two_stage_plan(&h).await;

        let report = h.coordinator.coordinate(task("m")).await;

        assert!(!report.success);
        assert_eq!(
            report.error,
            Some(TaskError::ShardUnavailable {
                shard_id: "m-shard-1".to_string()
            })
        );
    }
}
