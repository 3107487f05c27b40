//! The node runtime: peer table, gossip, background loops, and the public
//! API for announcing models and requesting inference.
//!
//! All mutable state lives in one shared struct behind `Arc`; the inbound
//! pump, heartbeat loop, and maintenance loop are tokio tasks that shut
//! down together through a watch channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capability::{unix_now, NodeCapability, NodeType, NODE_TYPE_COUNT};
use crate::config::NodeConfig;
use crate::dht::Dht;
use crate::errors::{P2pError, Result};
use crate::identity::NodeId;
use crate::inference::consensus::ConsensusEngine;
use crate::inference::coordinator::{InferenceCoordinator, ShardDispatcher};
use crate::inference::executor::InferenceExecutor;
use crate::inference::task::{InferenceReport, InferenceTask};
use crate::model::planner::{create_sharding_plan, optimize_shard_placement};
use crate::model::shard::{ShardPlan, ShardStore};
use crate::network::message::{Envelope, Payload};
use crate::network::stats::{MetricsSnapshot, NetworkStats};
use crate::network::transport::Transport;

/// An open connection to a peer.
#[derive(Debug, Clone)]
struct PeerConnection {
    connected_at: u64,
    last_message: u64,
    load: f64,
}

impl PeerConnection {
    fn new(now: u64) -> Self {
        Self {
            connected_at: now,
            last_message: now,
            load: 0.0,
        }
    }
}

/// Reply routed back to a waiting dispatch through the pending table.
#[derive(Debug)]
struct PendingReply {
    success: bool,
    result: Option<Value>,
    error: Option<String>,
}

/// State shared between the public API, the dispatcher, and the loops.
struct Shared {
    config: NodeConfig,
    local: RwLock<NodeCapability>,
    dht: Arc<RwLock<Dht>>,
    shards: Arc<RwLock<ShardStore>>,
    peers: RwLock<HashMap<NodeId, PeerConnection>>,
    seen: RwLock<HashMap<Uuid, Instant>>,
    pending: RwLock<HashMap<Uuid, oneshot::Sender<PendingReply>>>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn InferenceExecutor>,
    stats: Arc<NetworkStats>,
    running: AtomicBool,
}

/// Point-in-time view of the node, serializable for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub connected_peers: usize,
    pub known_nodes: usize,
    pub active_inferences: usize,
    pub metrics: MetricsSnapshot,
    /// Composite in [0, 1]: connectivity, role diversity, success rate
    pub health_score: f64,
}

pub struct NetworkManager {
    shared: Arc<Shared>,
    coordinator: Arc<InferenceCoordinator>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkManager {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        executor: Arc<dyn InferenceExecutor>,
    ) -> Self {
        let dht = Arc::new(RwLock::new(Dht::new(
            config.node_id.clone(),
            config.k_bucket_size,
        )));
        let shards = Arc::new(RwLock::new(ShardStore::new()));
        let local = RwLock::new(config.capability());

        let shared = Arc::new(Shared {
            local,
            dht: Arc::clone(&dht),
            shards: Arc::clone(&shards),
            peers: RwLock::new(HashMap::new()),
            seen: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            transport,
            executor,
            stats: Arc::new(NetworkStats::new()),
            running: AtomicBool::new(false),
            config,
        });

        let dispatcher = Arc::new(ManagerDispatcher {
            shared: Arc::clone(&shared),
        });
        let coordinator = Arc::new(InferenceCoordinator::new(
            shared.config.node_id.clone(),
            dht,
            shards,
            ConsensusEngine::new(
                shared.config.byzantine_tolerance,
                shared.config.numeric_tolerance,
            ),
            dispatcher as Arc<dyn ShardDispatcher>,
            shared.config.stale_after_secs,
        ));

        let (shutdown, _) = watch::channel(false);

        Self {
            shared,
            coordinator,
            inbound: Mutex::new(Some(inbound)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.shared.config.node_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Join the network and spawn the background loops.
    ///
    /// Bootstrap peers are tried in order; the first reachable one gets a
    /// direct announce plus a peer query. An empty (or fully unreachable)
    /// bootstrap list leaves the node running standalone.
    pub async fn start_network(&self, bootstrap: &[NodeId]) -> Result<()> {
        self.shared.running.store(true, Ordering::SeqCst);

        let inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| P2pError::Config("network already started".to_string()))?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(spawn_inbound_pump(
            Arc::clone(&self.shared),
            inbound,
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_heartbeat_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.coordinator),
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_maintenance_loop(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        ));
        drop(tasks);

        let now = unix_now();
        let capability = self.shared.local.read().await.clone();
        let mut joined = false;

        for peer in bootstrap {
            let announce = Envelope::new(
                self.node_id().clone(),
                Payload::NodeAnnounce {
                    capability: capability.clone(),
                },
            )
            .with_ttl(self.shared.config.default_message_ttl);

            match self.shared.send_to(peer, &announce).await {
                Ok(()) => {
                    self.shared
                        .peers
                        .write()
                        .await
                        .insert(peer.clone(), PeerConnection::new(now));

                    let query = Envelope::new(
                        self.node_id().clone(),
                        Payload::NodeQuery {
                            count: self.shared.config.target_peer_count,
                        },
                    );
                    self.shared.send_to(peer, &query).await?;

                    tracing::info!(bootstrap = %peer, "joined network");
                    joined = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(bootstrap = %peer, error = %err, "bootstrap peer unreachable");
                }
            }
        }

        if !bootstrap.is_empty() && !joined {
            tracing::warn!("all bootstrap peers unreachable, running standalone");
        }

        self.shared
            .broadcast(Payload::NodeAnnounce { capability })
            .await;

        let models: Vec<String> = {
            let local = self.shared.local.read().await;
            local.models.iter().cloned().collect()
        };
        for model_id in models {
            self.announce_model(&model_id, Value::Null).await;
        }

        tracing::info!(node_id = %self.node_id(), "network started");
        Ok(())
    }

    /// Stop the loops and drop in-flight work.
    pub async fn stop_network(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        self.shared.pending.write().await.clear();
        tracing::info!(node_id = %self.node_id(), "network stopped");
    }

    /// Start hosting a model: extend the local capability, record the
    /// metadata, and gossip the announcement.
    pub async fn announce_model(&self, model_id: &str, model_info: Value) {
        {
            let mut local = self.shared.local.write().await;
            local.models.insert(model_id.to_string());
        }
        self.shared
            .dht
            .write()
            .await
            .store_data(format!("model:{model_id}"), model_info.clone());

        self.shared
            .broadcast(Payload::ModelAnnounce {
                model_id: model_id.to_string(),
                host: self.node_id().clone(),
                model_info,
            })
            .await;

        tracing::info!(model_id, "model announced");
    }

    /// Build and register a sharding plan for a model over the current
    /// peer set, enabling pipeline inference for it.
    pub async fn register_shard_plan(
        &self,
        model_id: &str,
        total_layers: usize,
    ) -> Result<ShardPlan> {
        let mut candidates: Vec<NodeCapability> = {
            let dht = self.shared.dht.read().await;
            let now = unix_now();
            dht.nodes()
                .filter(|n| !n.is_stale(now, self.shared.config.stale_after_secs))
                .cloned()
                .collect()
        };
        candidates.push(self.shared.local.read().await.clone());

        let shards = create_sharding_plan(model_id, total_layers, &candidates)?;
        let placements = optimize_shard_placement(&shards, &candidates);

        let plan = ShardPlan {
            model_id: model_id.to_string(),
            total_layers,
            shards,
            placements,
        };
        self.shared.shards.write().await.register(plan.clone());
        Ok(plan)
    }

    /// Run one inference task across the mesh and report the outcome.
    pub async fn request_inference(
        &self,
        model_id: &str,
        input: Value,
        priority: u8,
        timeout: Duration,
    ) -> InferenceReport {
        let task = InferenceTask::new(model_id, input, self.node_id().clone())
            .with_priority(priority)
            .with_timeout(timeout)
            .with_redundancy(self.shared.config.default_redundancy);

        let report = self.coordinator.coordinate(task).await;

        if report.success {
            self.shared
                .stats
                .inferences_completed
                .fetch_add(1, Ordering::Relaxed);
            if report.consensus_reached {
                self.shared
                    .stats
                    .consensus_reached
                    .fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.shared
                .stats
                .inferences_failed
                .fetch_add(1, Ordering::Relaxed);
        }

        report
    }

    /// Current node status including the composite health score.
    pub async fn get_network_status(&self) -> NetworkStatus {
        let connected_peers = self.shared.peers.read().await.len();
        let (known_nodes, mut types) = {
            let dht = self.shared.dht.read().await;
            let types: Vec<NodeType> = dht.nodes().map(|n| n.node_type).collect();
            (dht.node_count(), types)
        };
        types.push(self.shared.config.node_type);
        types.sort_by_key(|t| *t as u8);
        types.dedup();

        let connectivity =
            (connected_peers as f64 / self.shared.config.target_peer_count as f64).min(1.0);
        let diversity = types.len() as f64 / NODE_TYPE_COUNT as f64;
        let success = self
            .shared
            .stats
            .inference_success_rate()
            .unwrap_or(0.5);
        let health_score = (connectivity + diversity + success) / 3.0;

        NetworkStatus {
            node_id: self.node_id().clone(),
            node_type: self.shared.config.node_type,
            connected_peers,
            known_nodes,
            active_inferences: self.coordinator.active_count().await,
            metrics: self.shared.stats.snapshot(),
            health_score,
        }
    }
}

impl Shared {
    /// Encode and send one envelope to one peer.
    async fn send_to(&self, peer: &NodeId, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        self.transport.send(peer, bytes).await?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Originate a broadcast: mark it seen so echoes are dropped, then send
    /// to every connected peer.
    async fn broadcast(&self, payload: Payload) {
        let envelope = Envelope::new(self.config.node_id.clone(), payload)
            .with_ttl(self.config.default_message_ttl);

        self.seen
            .write()
            .await
            .insert(envelope.message_id, Instant::now());

        let peers: Vec<NodeId> = self.peers.read().await.keys().cloned().collect();
        for peer in &peers {
            if let Err(err) = self.send_to(peer, &envelope).await {
                tracing::debug!(peer = %peer, error = %err, "broadcast send failed");
            }
        }
    }

    /// Relay a received broadcast to peers that have not seen it yet.
    ///
    /// A TTL of zero is never retransmitted; otherwise the TTL is
    /// decremented, this node is recorded in the path, and the envelope
    /// goes to every connected peer not already on the path.
    async fn forward(&self, mut envelope: Envelope) {
        if envelope.ttl == 0 {
            return;
        }
        envelope.ttl -= 1;
        envelope.record_hop(&self.config.node_id);

        let targets: Vec<NodeId> = {
            let peers = self.peers.read().await;
            peers
                .keys()
                .filter(|id| !envelope.path.contains(id))
                .cloned()
                .collect()
        };

        for peer in &targets {
            match self.send_to(peer, &envelope).await {
                Ok(()) => {
                    self.stats
                        .messages_forwarded
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "forward send failed");
                }
            }
        }
    }

    async fn handle_node_announce(&self, capability: NodeCapability, now: u64) {
        let node_id = capability.node_id.clone();
        let mut fresh = capability;
        fresh.touch(now);

        if self.dht.write().await.add_node(fresh) {
            tracing::debug!(node_id = %node_id, "peer capability recorded");
        }
    }

    async fn handle_node_query(&self, requester: &NodeId, count: usize) {
        // Lead with the local capability so the querier always learns the
        // responder, whatever `count` cuts off.
        let mut peers = vec![self.local.read().await.clone()];
        {
            let dht = self.dht.read().await;
            peers.extend(
                dht.nodes()
                    .filter(|n| n.node_id != *requester)
                    .cloned(),
            );
        }
        peers.truncate(count);

        let reply = Envelope::new(
            self.config.node_id.clone(),
            Payload::NodeResponse { peers },
        );
        if let Err(err) = self.send_to(requester, &reply).await {
            tracing::debug!(peer = %requester, error = %err, "node query reply failed");
        }
    }

    async fn handle_node_response(&self, peers: Vec<NodeCapability>, now: u64) {
        let mut dht = self.dht.write().await;
        for mut capability in peers {
            if capability.node_id == self.config.node_id {
                continue;
            }
            capability.touch(now);
            dht.add_node(capability);
        }
    }

    async fn handle_model_announce(&self, model_id: &str, host: &NodeId, model_info: Value) {
        let mut dht = self.dht.write().await;
        if dht.add_model_to_node(host, model_id) {
            tracing::debug!(model_id, host = %host, "model host recorded");
        }
        dht.store_data(format!("model:{model_id}"), model_info);
    }

    async fn handle_inference_request(
        &self,
        reply_to: NodeId,
        request_id: Uuid,
        task_id: Uuid,
        model_id: String,
        shard_id: Option<String>,
        input: Value,
    ) {
        let outcome = self
            .executor
            .execute(&model_id, shard_id.as_deref(), &input)
            .await;

        let payload = match outcome {
            Ok(result) => Payload::InferenceResponse {
                request_id,
                task_id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                tracing::warn!(task_id = %task_id, model_id, error = %err, "local execution failed");
                Payload::InferenceResponse {
                    request_id,
                    task_id,
                    success: false,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let reply = Envelope::new(self.config.node_id.clone(), payload);
        if let Err(err) = self.send_to(&reply_to, &reply).await {
            tracing::warn!(peer = %reply_to, error = %err, "inference reply failed");
        }
    }

    async fn handle_inference_response(
        &self,
        request_id: Uuid,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) {
        match self.pending.write().await.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(PendingReply {
                    success,
                    result,
                    error,
                });
            }
            None => {
                tracing::debug!(request_id = %request_id, "late reply for completed request");
            }
        }
    }

    async fn handle_network_update(&self, departed: &[NodeId]) {
        if departed.is_empty() {
            return;
        }
        let mut dht = self.dht.write().await;
        let mut peers = self.peers.write().await;
        for node_id in departed {
            dht.remove_node(node_id);
            peers.remove(node_id);
        }
        tracing::debug!(departed = departed.len(), "topology update applied");
    }

    /// One maintenance pass: evict stale peers, sweep the seen cache, and
    /// occasionally re-announce the local capability.
    async fn run_maintenance(&self) {
        let now = unix_now();

        let stale = {
            let dht = self.dht.read().await;
            dht.stale_nodes(now, self.config.stale_after_secs)
        };

        if !stale.is_empty() {
            let mut dht = self.dht.write().await;
            let mut peers = self.peers.write().await;
            for node_id in &stale {
                dht.remove_node(node_id);
                peers.remove(node_id);
                self.stats.peers_evicted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(node_id = %node_id, "stale peer evicted");
            }
        }

        {
            let ttl = self.config.message_cache_ttl();
            let mut seen = self.seen.write().await;
            seen.retain(|_, inserted| inserted.elapsed() < ttl);
        }

        if !stale.is_empty() {
            let known_nodes = self.dht.read().await.node_count();
            self.broadcast(Payload::NetworkUpdate {
                known_nodes,
                departed: stale,
            })
            .await;
        }

        if rand::random::<f64>() < 0.1 {
            let capability = self.local.read().await.clone();
            self.broadcast(Payload::NodeAnnounce { capability }).await;
        }
    }
}

/// Process one inbound envelope.
async fn handle_envelope(shared: &Arc<Shared>, envelope: Envelope) {
    shared
        .stats
        .messages_received
        .fetch_add(1, Ordering::Relaxed);

    if envelope.sender_id == shared.config.node_id {
        return;
    }

    let now = unix_now();
    {
        let mut peers = shared.peers.write().await;
        peers
            .entry(envelope.sender_id.clone())
            .or_insert_with(|| PeerConnection::new(now))
            .last_message = now;
    }
    shared.dht.write().await.touch(&envelope.sender_id, now);

    if envelope.payload.is_broadcast() {
        let mut seen = shared.seen.write().await;
        if seen.contains_key(&envelope.message_id) {
            shared
                .stats
                .messages_deduplicated
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        seen.insert(envelope.message_id, Instant::now());
    }

    tracing::trace!(
        kind = envelope.payload.kind(),
        sender = %envelope.sender_id,
        ttl = envelope.ttl,
        "handling message"
    );

    let forward_copy = envelope.payload.is_broadcast().then(|| envelope.clone());

    match envelope.payload {
        Payload::NodeAnnounce { capability } => {
            shared.handle_node_announce(capability, now).await;
        }
        Payload::NodeQuery { count } => {
            shared.handle_node_query(&envelope.sender_id, count).await;
        }
        Payload::NodeResponse { peers } => {
            shared.handle_node_response(peers, now).await;
        }
        Payload::ModelAnnounce {
            model_id,
            host,
            model_info,
        } => {
            shared
                .handle_model_announce(&model_id, &host, model_info)
                .await;
        }
        Payload::ModelRequest { model_id } => {
            tracing::debug!(model_id, sender = %envelope.sender_id, "model request received");
        }
        Payload::InferenceRequest {
            request_id,
            task_id,
            model_id,
            shard_id,
            input,
        } => {
            // Execution may block on the backend; never stall the pump.
            let shared = Arc::clone(shared);
            let reply_to = envelope.sender_id.clone();
            tokio::spawn(async move {
                shared
                    .handle_inference_request(
                        reply_to, request_id, task_id, model_id, shard_id, input,
                    )
                    .await;
            });
        }
        Payload::InferenceResponse {
            request_id,
            success,
            result,
            error,
            ..
        } => {
            shared
                .handle_inference_response(request_id, success, result, error)
                .await;
        }
        Payload::Heartbeat { load, .. } => {
            if let Some(conn) = shared.peers.write().await.get_mut(&envelope.sender_id) {
                conn.load = load;
            }
        }
        Payload::NetworkUpdate { departed, .. } => {
            shared.handle_network_update(&departed).await;
        }
    }

    if let Some(copy) = forward_copy {
        shared.forward(copy).await;
    }
}

/// Dispatch boundary implementation over the message substrate.
///
/// A local target runs straight through the executor; a remote target gets
/// a directed `InferenceRequest` and a oneshot parked in the pending table
/// until the reply or the timeout, whichever first.
struct ManagerDispatcher {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl ShardDispatcher for ManagerDispatcher {
    async fn dispatch(
        &self,
        target: &NodeId,
        task_id: Uuid,
        model_id: &str,
        shard_id: Option<&str>,
        input: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        if *target == self.shared.config.node_id {
            return self.shared.executor.execute(model_id, shard_id, input).await;
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.write().await.insert(request_id, tx);

        let envelope = Envelope::new(
            self.shared.config.node_id.clone(),
            Payload::InferenceRequest {
                request_id,
                task_id,
                model_id: model_id.to_string(),
                shard_id: shard_id.map(str::to_string),
                input: input.clone(),
            },
        );

        if let Err(err) = self.shared.send_to(target, &envelope).await {
            self.shared.pending.write().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.success => Ok(reply.result.unwrap_or(Value::Null)),
            Ok(Ok(reply)) => Err(P2pError::Transport(
                reply
                    .error
                    .unwrap_or_else(|| "remote execution failed".to_string()),
            )),
            Ok(Err(_)) => {
                self.shared.pending.write().await.remove(&request_id);
                Err(P2pError::Transport("reply channel dropped".to_string()))
            }
            Err(_) => {
                self.shared.pending.write().await.remove(&request_id);
                Err(P2pError::Transport(format!(
                    "no reply from {target} within {timeout:?}"
                )))
            }
        }
    }
}

fn spawn_inbound_pump(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = inbound.recv() => match received {
                    Some(bytes) => match Envelope::from_bytes(&bytes) {
                        Ok(envelope) => handle_envelope(&shared, envelope).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping undecodable message");
                        }
                    },
                    None => break,
                },
            }
        }
        tracing::debug!("inbound pump stopped");
    })
}

fn spawn_heartbeat_loop(
    shared: Arc<Shared>,
    coordinator: Arc<InferenceCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let active = coordinator.active_count().await;
                    let load =
                        (active as f64 / shared.config.target_peer_count as f64).min(1.0);
                    shared
                        .broadcast(Payload::Heartbeat {
                            load,
                            active_inferences: active,
                        })
                        .await;
                }
            }
        }
        tracing::debug!("heartbeat loop stopped");
    })
}

fn spawn_maintenance_loop(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.maintenance_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh node does not
        // run maintenance before meeting anyone.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => shared.run_maintenance().await,
            }
        }
        tracing::debug!("maintenance loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::executor::MockExecutor;
    use crate::network::transport::InMemoryHub;
    use serde_json::json;

    async fn node(hub: &InMemoryHub, id: &str, models: &[&str]) -> NetworkManager {
        let mut config = NodeConfig::named(NodeId::new(id), NodeType::Full);
        config.models = models.iter().map(|m| m.to_string()).collect();
        let (transport, inbound) = hub.register(NodeId::new(id)).await;
        NetworkManager::new(
            config,
            Arc::new(transport),
            inbound,
            Arc::new(MockExecutor::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bootstrap_join_exchanges_capabilities() {
        let hub = InMemoryHub::new();
        let seed = node(&hub, "seed", &["m"]).await;
        let joiner = node(&hub, "joiner", &[]).await;

        seed.start_network(&[]).await.unwrap();
        joiner
            .start_network(&[NodeId::new("seed")])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let seed_status = seed.get_network_status().await;
        let joiner_status = joiner.get_network_status().await;
        assert_eq!(seed_status.known_nodes, 1);
        assert_eq!(joiner_status.known_nodes, 1);

        seed.stop_network().await;
        joiner.stop_network().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_model_announce_reaches_peer() {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", &[]).await;
        let b = node(&hub, "b", &[]).await;

        a.start_network(&[]).await.unwrap();
        b.start_network(&[NodeId::new("a")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.announce_model("ocr-v1", json!({"layers": 24})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let dht = a.shared.dht.read().await;
        let host = dht.get_node(&NodeId::new("b")).unwrap();
        assert!(host.hosts_model("ocr-v1"));
        let stored = dht.get_data("model:ocr-v1").unwrap();
        assert_eq!(stored.value["layers"], 24);
        drop(dht);

        a.stop_network().await;
        b.stop_network().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_node_query_reply_always_includes_responder() {
        let hub = InMemoryHub::new();
        let seed = node(&hub, "seed", &[]).await;
        let other = node(&hub, "other", &[]).await;

        seed.start_network(&[]).await.unwrap();
        other.start_network(&[NodeId::new("seed")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The joiner asks for a single peer; the reply must still carry the
        // seed itself, not just the seed's other known nodes.
        let mut config = NodeConfig::named(NodeId::new("joiner"), NodeType::Full);
        config.target_peer_count = 1;
        let (transport, inbound) = hub.register(NodeId::new("joiner")).await;
        let joiner = NetworkManager::new(
            config,
            Arc::new(transport),
            inbound,
            Arc::new(MockExecutor::new()),
        );
        joiner.start_network(&[NodeId::new("seed")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let dht = joiner.shared.dht.read().await;
        assert!(dht.get_node(&NodeId::new("seed")).is_some());
        drop(dht);

        seed.stop_network().await;
        other.stop_network().await;
        joiner.stop_network().await;
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", &[]).await;

        a.start_network(&[]).await.unwrap();
        assert!(a.start_network(&[]).await.is_err());
        a.stop_network().await;
    }

    #[tokio::test]
    async fn test_health_score_bounds() {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", &[]).await;

        let status = a.get_network_status().await;
        assert!(status.health_score >= 0.0 && status.health_score <= 1.0);
        // Standalone: no peers, one role, neutral success rate.
        let expected = (0.0 + 0.25 + 0.5) / 3.0;
        assert!((status.health_score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_register_shard_plan_standalone_uses_local_node() {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", &["m"]).await;

        let plan = a.register_shard_plan("m", 8).await.unwrap();
        assert_eq!(plan.shards.len(), 1);
        assert_eq!(plan.hosts(&plan.shards[0].shard_id), &[NodeId::new("a")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peers_already_in_path_are_skipped() {
        let hub = InMemoryHub::new();
        let b = node(&hub, "b", &[]).await;
        let c = node(&hub, "c", &[]).await;
        let d = node(&hub, "d", &[]).await;

        b.start_network(&[]).await.unwrap();
        c.start_network(&[NodeId::new("b")]).await.unwrap();
        d.start_network(&[NodeId::new("b")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let c_before = c.shared.stats.messages_received.load(Ordering::Relaxed);
        let d_before = d.shared.stats.messages_received.load(Ordering::Relaxed);

        // A broadcast that already visited c: b must relay it to d only.
        let mut envelope = Envelope::new(
            NodeId::new("a"),
            Payload::Heartbeat {
                load: 0.3,
                active_inferences: 0,
            },
        );
        envelope.record_hop(&NodeId::new("c"));

        let (probe, _rx) = hub.register(NodeId::new("a")).await;
        probe
            .send(&NodeId::new("b"), envelope.to_bytes().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let c_after = c.shared.stats.messages_received.load(Ordering::Relaxed);
        let d_after = d.shared.stats.messages_received.load(Ordering::Relaxed);
        assert_eq!(c_before, c_after, "peer in path must not be contacted");
        assert!(d_after > d_before, "peer outside path must get the relay");

        b.stop_network().await;
        c.stop_network().await;
        d.stop_network().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ttl_zero_is_not_forwarded() {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", &[]).await;
        let b = node(&hub, "b", &[]).await;
        let c = node(&hub, "c", &[]).await;

        a.start_network(&[]).await.unwrap();
        b.start_network(&[NodeId::new("a")]).await.unwrap();
        c.start_network(&[NodeId::new("b")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Hand b a ttl-0 heartbeat from a; b must handle but not relay.
        let before = c.shared.stats.messages_received.load(Ordering::Relaxed);
        let envelope = Envelope::new(
            NodeId::new("a"),
            Payload::Heartbeat {
                load: 0.1,
                active_inferences: 0,
            },
        )
        .with_ttl(0);
        let (a_transport, _rx) = hub.register(NodeId::new("a-probe")).await;
        a_transport
            .send(&NodeId::new("b"), envelope.to_bytes().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = c.shared.stats.messages_received.load(Ordering::Relaxed);
        assert_eq!(before, after);

        a.stop_network().await;
        b.stop_network().await;
        c.stop_network().await;
    }
}
