//! The scheduling loop.
//!
//! Keeps two pieces of derived state in memory (the eligible-node heap
//! and the set of unassigned tasks) synchronized from store events, and
//! commits placement decisions back through the store. Everything here
//! is reconstructible: on event lag the loop resynchronizes from a fresh
//! view instead of trusting its caches.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_store::{
    Filter, Kind, Node, NodeAvailability, NodeMembership, NodeResources, NodeState, Store,
    StoreEvent, Task, TaskState, WatchError,
};

use crate::constraint::{node_fits, Constraint};
use crate::error::SchedulerResult;
use crate::heap::{NodeHeap, NodeInfo};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between placement passes.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
        }
    }
}

pub struct Scheduler {
    store: Store,
    config: SchedulerConfig,
    heap: NodeHeap,
    /// Tasks waiting for placement, keyed by id for stable iteration.
    unassigned: BTreeMap<String, Task>,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: SchedulerConfig::default(),
            heap: NodeHeap::new(),
            unassigned: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until shutdown. Transient store conflicts are absorbed and
    /// retried on the next tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        let mut events = self
            .store
            .watch_where(|e| matches!(e.kind(), Kind::Task | Kind::Node));
        self.sync();
        info!(nodes = self.heap.len(), pending = self.unassigned.len(), "scheduler started");

        let mut tick = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Ok(event) => self.handle_event(event).await?,
                    Err(WatchError::Lagged(n)) => {
                        warn!(missed = n, "scheduler lagged behind store events; resyncing");
                        events = self
                            .store
                            .watch_where(|e| matches!(e.kind(), Kind::Task | Kind::Node));
                        self.sync();
                    }
                    Err(WatchError::Closed) => return Ok(()),
                },
                _ = tick.tick() => {
                    if let Err(err) = self.schedule_pending().await {
                        warn!(error = %err, "placement pass failed; will retry");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Rebuild heap and pending set from a fresh view.
    fn sync(&mut self) {
        self.heap = NodeHeap::new();
        self.unassigned.clear();

        let (nodes, tasks) = self.store.view(|tx| {
            (
                tx.find::<Node>(&Filter::All),
                tx.find::<Task>(&Filter::All),
            )
        });

        for node in nodes {
            if eligible(&node) {
                let mut info = NodeInfo::new(node);
                let (count, reserved) = self.commitments(info.id());
                info.task_count = count;
                info.reserved = reserved;
                self.heap.put(info);
            }
        }
        for task in tasks {
            if wants_placement(&task) {
                self.unassigned.insert(task.id.clone(), task);
            }
        }
    }

    async fn handle_event(&mut self, event: StoreEvent) -> SchedulerResult<()> {
        match &event {
            StoreEvent::Created(obj) | StoreEvent::Updated(obj) => match obj {
                flotilla_store::Object::Task(task) => {
                    if wants_placement(task) {
                        self.unassigned.insert(task.id.clone(), task.clone());
                    } else {
                        self.unassigned.remove(&task.id);
                    }
                    if let Some(node_id) = &task.node_id {
                        self.refresh_node_commitments(node_id);
                    }
                }
                flotilla_store::Object::Node(node) => {
                    self.node_changed(node).await?;
                }
                _ => {}
            },
            StoreEvent::Deleted(obj) => match obj {
                flotilla_store::Object::Task(task) => {
                    self.unassigned.remove(&task.id);
                    if let Some(node_id) = &task.node_id {
                        self.refresh_node_commitments(node_id);
                    }
                }
                flotilla_store::Object::Node(node) => {
                    self.heap.remove(&node.id);
                    self.evacuate(&node.id).await?;
                }
                _ => {}
            },
        }
        Ok(())
    }

    async fn node_changed(&mut self, node: &Node) -> SchedulerResult<()> {
        if eligible(node) {
            let mut info = NodeInfo::new(node.clone());
            let (count, reserved) = self.commitments(&node.id);
            info.task_count = count;
            info.reserved = reserved;
            self.heap.put(info);
            return Ok(());
        }

        self.heap.remove(&node.id);
        if node.spec.availability == NodeAvailability::Drain {
            self.evacuate(&node.id).await?;
        }
        Ok(())
    }

    /// Mark every non-terminal task on a drained or deleted node for
    /// removal; replacements come from the orchestrator once the reaper
    /// collects them.
    async fn evacuate(&self, node_id: &str) -> SchedulerResult<()> {
        let victims: Vec<Task> = self.store.view(|tx| {
            tx.find::<Task>(&Filter::ByNode(node_id.to_string()))
                .into_iter()
                .filter(|t| !t.is_terminal() && t.desired_state < TaskState::Remove)
                .collect()
        });
        if victims.is_empty() {
            return Ok(());
        }

        info!(node_id, count = victims.len(), "evacuating tasks from node");
        self.store
            .update(|tx| {
                for victim in &victims {
                    let Some(mut task) = tx.get::<Task>(&victim.id) else {
                        continue;
                    };
                    if task.desired_state >= TaskState::Remove {
                        continue;
                    }
                    task.desired_state = TaskState::Remove;
                    tx.update(task)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// One placement pass over the pending set.
    async fn schedule_pending(&mut self) -> SchedulerResult<()> {
        if self.unassigned.is_empty() || self.heap.is_empty() {
            return Ok(());
        }

        // Group by service so one service cannot starve the others.
        let mut by_service: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for task in self.unassigned.values() {
            by_service
                .entry(task.service_id.clone())
                .or_default()
                .push(task.clone());
        }

        let mut decisions: Vec<(String, String)> = Vec::new();
        let mut constraint_cache: HashMap<String, Option<Vec<Constraint>>> = HashMap::new();

        for (service_id, tasks) in by_service {
            for task in tasks {
                let constraints = constraint_cache
                    .entry(service_id.clone())
                    .or_insert_with(|| Constraint::parse_all(&task.spec.placement.constraints).ok());
                let Some(constraints) = constraints else {
                    // Unparseable constraints: leave the task unassigned.
                    warn!(task_id = %task.id, "invalid placement constraints");
                    continue;
                };

                let scan_all = !constraints.is_empty();
                let picked = self
                    .heap
                    .find_min(|info| node_fits(&task.spec, constraints, info), scan_all)
                    .map(|info| info.id().to_string());

                match picked {
                    Some(node_id) => {
                        // Reflect the decision in the heap so the rest of
                        // the pass spreads over remaining capacity.
                        if let Some(info) = self.heap.get(&node_id) {
                            let count = info.task_count + 1;
                            let mut reserved = info.reserved;
                            reserved.nano_cpus += task.spec.resources.reservations.nano_cpus;
                            reserved.memory_bytes +=
                                task.spec.resources.reservations.memory_bytes;
                            self.heap.update_count(&node_id, count, reserved);
                        }
                        decisions.push((task.id.clone(), node_id));
                    }
                    None => {
                        debug!(task_id = %task.id, "no feasible node; leaving unassigned");
                    }
                }
            }
        }

        if decisions.is_empty() {
            return Ok(());
        }

        let committed = decisions.clone();
        self.store
            .update(|tx| {
                for (task_id, node_id) in &decisions {
                    let Some(mut task) = tx.get::<Task>(task_id) else {
                        continue;
                    };
                    if !wants_placement(&task) {
                        continue;
                    }
                    task.node_id = Some(node_id.clone());
                    task.status.state = TaskState::Assigned;
                    task.status.message = "scheduler assigned task".to_string();
                    task.status.timestamp = flotilla_store::epoch_secs();
                    tx.update(task)?;
                }
                Ok(())
            })
            .await?;

        for (task_id, node_id) in committed {
            self.unassigned.remove(&task_id);
            debug!(%task_id, %node_id, "task assigned");
        }
        Ok(())
    }

    fn refresh_node_commitments(&mut self, node_id: &str) {
        let (count, reserved) = self.commitments(node_id);
        self.heap.update_count(node_id, count, reserved);
    }

    /// Current task count and reserved resources for a node.
    fn commitments(&self, node_id: &str) -> (usize, NodeResources) {
        self.store.view(|tx| {
            let tasks = tx.find::<Task>(&Filter::ByNode(node_id.to_string()));
            let live = tasks.iter().filter(|t| !t.is_terminal());
            let mut count = 0;
            let mut reserved = NodeResources::default();
            for task in live {
                count += 1;
                reserved.nano_cpus += task.spec.resources.reservations.nano_cpus;
                reserved.memory_bytes += task.spec.resources.reservations.memory_bytes;
            }
            (count, reserved)
        })
    }
}

/// Nodes the scheduler may place tasks on.
fn eligible(node: &Node) -> bool {
    node.status.state == NodeState::Ready
        && node.spec.availability == NodeAvailability::Active
        && node.spec.membership == NodeMembership::Accepted
}

/// Tasks waiting for a placement decision.
fn wants_placement(task: &Task) -> bool {
    task.node_id.is_none()
        && task.status.state == TaskState::Allocated
        && task.desired_state <= TaskState::Running
}
