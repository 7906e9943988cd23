//! Dispatcher core: session registry, assignment pumps, heartbeat TTLs,
//! status ingestion.
//!
//! The gRPC layer in `server` is a thin shim over this; everything here
//! is directly testable against an in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flotilla_proto::dispatcher::{
    AssignmentSet, SessionMessage, TaskAssignment, WeightedManager,
};
use flotilla_store::{
    new_id, Filter, Kind, Node, NodeDescription, NodeMembership, NodeState, Object, Store,
    StoreEvent, Task, TaskState, TaskStatus, WatchError,
};

use crate::error::{DispatcherError, DispatcherResult};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Heartbeat period handed to agents.
    pub heartbeat_period: Duration,
    /// Missed-beat budget, as a multiple of the period.
    pub grace_multiple: u32,
    /// How often sessions rebroadcast the manager list.
    pub manager_refresh: Duration,
    /// Registrations allowed per node within one heartbeat period.
    pub registration_burst: u32,
    /// Queued session messages per agent before the session is dropped.
    pub session_queue: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(5),
            grace_multiple: 3,
            manager_refresh: Duration::from_secs(30),
            registration_burst: 3,
            session_queue: 64,
        }
    }
}

/// A manager address with its load-balancing weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedPeer {
    pub addr: String,
    pub weight: i32,
}

struct SessionRecord {
    session_id: String,
    last_heartbeat: Instant,
    registered_at: Instant,
    recent_registrations: u32,
    tx: mpsc::Sender<SessionMessage>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    config: DispatcherConfig,
    nodes: Arc<Mutex<HashMap<String, SessionRecord>>>,
    managers: Arc<RwLock<Vec<WeightedPeer>>>,
}

impl Dispatcher {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: DispatcherConfig::default(),
            nodes: Arc::new(Mutex::new(HashMap::new())),
            managers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Replace the advertised manager set; sessions pick it up on their
    /// next refresh.
    pub fn set_managers(&self, managers: Vec<WeightedPeer>) {
        *self.managers.write().unwrap() = managers;
    }

    /// Heartbeat-expiry sweep; run alongside the gRPC server.
    pub async fn run_expiry(&self, mut shutdown: watch::Receiver<bool>) {
        let grace = self.config.heartbeat_period * self.config.grace_multiple;
        let mut tick = tokio::time::interval(self.config.heartbeat_period / 2);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let expired: Vec<String> = {
                        let mut nodes = self.nodes.lock().unwrap();
                        let expired: Vec<String> = nodes
                            .iter()
                            .filter(|(_, rec)| rec.last_heartbeat.elapsed() > grace)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in &expired {
                            if let Some(rec) = nodes.remove(id) {
                                // Closing the channel ends the stream.
                                drop(rec);
                            }
                        }
                        expired
                    };
                    for node_id in expired {
                        warn!(%node_id, "heartbeat grace exceeded; marking node down");
                        if let Err(err) = self.set_node_state(&node_id, NodeState::Down, "heartbeat expired").await {
                            warn!(%node_id, error = %err, "failed to mark node down");
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Open a session for a node. Returns the receiver the transport
    /// layer streams to the agent.
    pub async fn register(
        &self,
        node_id: &str,
        description: Option<NodeDescription>,
    ) -> DispatcherResult<(String, mpsc::Receiver<SessionMessage>)> {
        let node = self
            .store
            .view(|tx| tx.get::<Node>(node_id))
            .ok_or_else(|| DispatcherError::NodeNotRegistered(node_id.to_string()))?;
        if node.spec.membership != NodeMembership::Accepted {
            return Err(DispatcherError::NotAccepted(node_id.to_string()));
        }

        let session_id = new_id();
        let (tx, rx) = mpsc::channel(self.config.session_queue);
        {
            let mut nodes = self.nodes.lock().unwrap();
            let recent = match nodes.get(node_id) {
                Some(old) if old.registered_at.elapsed() < self.config.heartbeat_period => {
                    old.recent_registrations + 1
                }
                _ => 1,
            };
            if recent > self.config.registration_burst {
                return Err(DispatcherError::RateLimited(node_id.to_string()));
            }
            // Supersedes any previous session: dropping its sender ends
            // the old stream.
            nodes.insert(
                node_id.to_string(),
                SessionRecord {
                    session_id: session_id.clone(),
                    last_heartbeat: Instant::now(),
                    registered_at: Instant::now(),
                    recent_registrations: recent,
                    tx: tx.clone(),
                },
            );
        }

        self.admit_node(&node, description).await?;
        info!(%node_id, %session_id, "agent session registered");

        self.spawn_session_pump(node_id.to_string(), session_id.clone(), tx);
        Ok((session_id, rx))
    }

    /// Process a heartbeat; returns the period the agent should use.
    pub fn heartbeat(&self, node_id: &str, session_id: &str) -> DispatcherResult<Duration> {
        let mut nodes = self.nodes.lock().unwrap();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| DispatcherError::NodeNotRegistered(node_id.to_string()))?;
        if record.session_id != session_id {
            return Err(DispatcherError::SessionExpired(node_id.to_string()));
        }
        record.last_heartbeat = Instant::now();
        Ok(self.config.heartbeat_period)
    }

    /// Ingest a batch of status reports.
    ///
    /// Reports are coalesced per task (latest wins), regressing
    /// transitions are dropped, and the survivors commit in one store
    /// transaction. Returns the task ids the agent may stop retrying.
    pub async fn update_task_status(
        &self,
        node_id: &str,
        session_id: &str,
        updates: Vec<(String, TaskStatus)>,
    ) -> DispatcherResult<Vec<String>> {
        {
            let nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get(node_id)
                .ok_or_else(|| DispatcherError::NodeNotRegistered(node_id.to_string()))?;
            if record.session_id != session_id {
                return Err(DispatcherError::SessionExpired(node_id.to_string()));
            }
        }

        // Latest report per task wins.
        let mut latest: HashMap<String, TaskStatus> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (task_id, status) in updates {
            if !latest.contains_key(&task_id) {
                order.push(task_id.clone());
            }
            latest.insert(task_id, status);
        }

        let acked: Vec<String> = order.clone();
        self.store
            .update(|tx| {
                for task_id in &order {
                    let status = &latest[task_id];
                    let Some(mut task) = tx.get::<Task>(task_id) else {
                        // Deleted while the report was in flight.
                        continue;
                    };
                    if task.node_id.as_deref() != Some(node_id) {
                        warn!(%task_id, %node_id, "status report from non-owning node dropped");
                        continue;
                    }
                    if status.state < task.status.state {
                        warn!(
                            %task_id,
                            have = %task.status.state,
                            got = %status.state,
                            "regressing status report dropped"
                        );
                        continue;
                    }
                    if status.state == task.status.state && status.err == task.status.err {
                        continue;
                    }
                    task.status = status.clone();
                    tx.update(task)?;
                }
                Ok(())
            })
            .await?;

        Ok(acked)
    }

    /// Assignment set for a node: its tasks with a runnable desired
    /// state. Tasks past `Running` (including `Remove`) leave the set,
    /// which is the agent's signal to shut them down.
    pub fn assignments_for(&self, node_id: &str) -> Vec<Task> {
        self.store.view(|tx| {
            tx.find::<Task>(&Filter::ByNode(node_id.to_string()))
                .into_iter()
                .filter(|t| t.desired_state <= TaskState::Running)
                .collect()
        })
    }

    /// Nodes with a live session.
    pub fn connected_nodes(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    fn manager_list(&self) -> Vec<WeightedManager> {
        self.managers
            .read()
            .unwrap()
            .iter()
            .map(|peer| WeightedManager {
                addr: peer.addr.clone(),
                weight: peer.weight,
            })
            .collect()
    }

    /// Mark the node ready and record its self-reported description.
    async fn admit_node(
        &self,
        node: &Node,
        description: Option<NodeDescription>,
    ) -> DispatcherResult<()> {
        let node_id = node.id.clone();
        self.store
            .update(|tx| {
                let Some(mut node) = tx.get::<Node>(&node_id) else {
                    return Ok(());
                };
                node.status.state = NodeState::Ready;
                node.status.message = String::new();
                if let Some(desc) = &description {
                    node.description = Some(desc.clone());
                }
                tx.update(node)
            })
            .await?;
        Ok(())
    }

    async fn set_node_state(
        &self,
        node_id: &str,
        state: NodeState,
        message: &str,
    ) -> DispatcherResult<()> {
        self.store
            .update(|tx| {
                let Some(mut node) = tx.get::<Node>(node_id) else {
                    return Ok(());
                };
                if node.status.state == state {
                    return Ok(());
                }
                node.status.state = state;
                node.status.message = message.to_string();
                tx.update(node)
            })
            .await?;
        Ok(())
    }

    /// Feed one session: the full set first, then deltas as the node's
    /// tasks change, plus periodic manager-list refreshes.
    fn spawn_session_pump(
        &self,
        node_id: String,
        session_id: String,
        tx: mpsc::Sender<SessionMessage>,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            // Subscribe before the initial read so no commit is missed.
            let watch_node = node_id.clone();
            let mut events = dispatcher.store.watch_where(move |e| {
                e.kind() == Kind::Task && task_of(e).is_some_and(|t| t.node_id.as_deref() == Some(watch_node.as_str()))
            });

            let full = dispatcher.assignments_for(&node_id);
            let mut known: HashMap<String, Task> =
                full.iter().map(|t| (t.id.clone(), t.clone())).collect();
            let initial = SessionMessage {
                session_id: session_id.clone(),
                managers: dispatcher.manager_list(),
                assignments: Some(AssignmentSet {
                    full: true,
                    updated: full.iter().filter_map(assignment).collect(),
                    removed: Vec::new(),
                }),
                disconnect: false,
            };
            if tx.send(initial).await.is_err() {
                return;
            }

            let mut refresh = tokio::time::interval(dispatcher.config.manager_refresh);
            refresh.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    event = events.next() => {
                        let message = match event {
                            Ok(event) => {
                                match delta_for(&event, &node_id, &mut known) {
                                    Some(assignments) => SessionMessage {
                                        session_id: session_id.clone(),
                                        managers: Vec::new(),
                                        assignments: Some(assignments),
                                        disconnect: false,
                                    },
                                    None => continue,
                                }
                            }
                            Err(WatchError::Lagged(n)) => {
                                // Missed deltas cannot be reconstructed;
                                // resend the full set.
                                debug!(%node_id, missed = n, "session pump lagged; resending full set");
                                events = {
                                    let watch_node = node_id.clone();
                                    dispatcher.store.watch_where(move |e| {
                                        e.kind() == Kind::Task
                                            && task_of(e).is_some_and(|t| {
                                                t.node_id.as_deref() == Some(watch_node.as_str())
                                            })
                                    })
                                };
                                let full = dispatcher.assignments_for(&node_id);
                                known = full.iter().map(|t| (t.id.clone(), t.clone())).collect();
                                SessionMessage {
                                    session_id: session_id.clone(),
                                    managers: dispatcher.manager_list(),
                                    assignments: Some(AssignmentSet {
                                        full: true,
                                        updated: full.iter().filter_map(assignment).collect(),
                                        removed: Vec::new(),
                                    }),
                                    disconnect: false,
                                }
                            }
                            Err(WatchError::Closed) => return,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    _ = refresh.tick() => {
                        let message = SessionMessage {
                            session_id: session_id.clone(),
                            managers: dispatcher.manager_list(),
                            assignments: None,
                            disconnect: false,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });
    }
}

fn task_of(event: &StoreEvent) -> Option<&Task> {
    match event.object() {
        Object::Task(task) => Some(task),
        _ => None,
    }
}

fn assignment(task: &Task) -> Option<TaskAssignment> {
    let bytes = serde_json::to_vec(task).ok()?;
    Some(TaskAssignment {
        task_id: task.id.clone(),
        task: bytes,
    })
}

/// Turn one store event into an assignment delta, updating the session's
/// view of what the agent knows.
fn delta_for(
    event: &StoreEvent,
    node_id: &str,
    known: &mut HashMap<String, Task>,
) -> Option<AssignmentSet> {
    let task = task_of(event)?;
    debug_assert_eq!(task.node_id.as_deref(), Some(node_id));

    let in_set = matches!(event, StoreEvent::Created(_) | StoreEvent::Updated(_))
        && task.desired_state <= TaskState::Running;

    if in_set {
        // Suppress no-op deltas (e.g. pure status-report writes).
        if let Some(prev) = known.get(&task.id) {
            if prev.spec == task.spec && prev.desired_state == task.desired_state {
                known.insert(task.id.clone(), task.clone());
                return None;
            }
        }
        known.insert(task.id.clone(), task.clone());
        Some(AssignmentSet {
            full: false,
            updated: assignment(task).into_iter().collect(),
            removed: Vec::new(),
        })
    } else {
        known.remove(&task.id)?;
        Some(AssignmentSet {
            full: false,
            updated: Vec::new(),
            removed: vec![task.id.clone()],
        })
    }
}
