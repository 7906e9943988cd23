//! The reconciliation loop.
//!
//! Compares declared services against observed tasks and writes the
//! difference back as task creations, desired-state changes and
//! deletions. Replacement of terminal tasks goes through the restart
//! supervisor so delays and attempt budgets hold; slot creation for
//! brand-new capacity happens directly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_store::{
    epoch_secs, new_id, Filter, Kind, Node, NodeAvailability, NodeMembership, NodeState, Object,
    Service, ServiceMode, Store, StoreEvent, Task, TaskState, TaskStatus, WatchError,
};

use crate::error::OrchestratorResult;
use crate::restart::{RestartSupervisor, SlotKey};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pause between restart/update progress passes.
    pub tick_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
        }
    }
}

pub struct Orchestrator {
    store: Store,
    config: OrchestratorConfig,
    restarts: RestartSupervisor,
    /// Rolling updates in flight: service id → last batch time.
    update_batches: HashMap<String, Instant>,
}

impl Orchestrator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: OrchestratorConfig::default(),
            restarts: RestartSupervisor::new(),
            update_batches: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until shutdown. Walks every service once before processing
    /// events, so a fresh leader converges from whatever state it
    /// inherited.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> OrchestratorResult<()> {
        let mut events = self
            .store
            .watch_where(|e| matches!(e.kind(), Kind::Service | Kind::Task | Kind::Node));

        self.reconcile_all().await?;
        info!("orchestrator started");

        let mut tick = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Ok(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            warn!(error = %err, "orchestrator event handling failed");
                        }
                    }
                    Err(WatchError::Lagged(n)) => {
                        warn!(missed = n, "orchestrator lagged; full reconcile");
                        events = self.store.watch_where(
                            |e| matches!(e.kind(), Kind::Service | Kind::Task | Kind::Node),
                        );
                        self.reconcile_all().await?;
                    }
                    Err(WatchError::Closed) => return Ok(()),
                },
                _ = tick.tick() => {
                    if let Err(err) = self.progress().await {
                        warn!(error = %err, "orchestrator progress pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("orchestrator shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn reconcile_all(&mut self) -> OrchestratorResult<()> {
        let services = self.store.view(|tx| tx.find::<Service>(&Filter::All));
        for service in services {
            self.reconcile(&service, &HashSet::new()).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: StoreEvent) -> OrchestratorResult<()> {
        match event {
            StoreEvent::Created(Object::Service(service))
            | StoreEvent::Updated(Object::Service(service)) => {
                self.reconcile(&service, &HashSet::new()).await?;
            }
            StoreEvent::Deleted(Object::Service(service)) => {
                self.restarts.forget_service(&service.id);
                self.update_batches.remove(&service.id);
                self.remove_service_tasks(&service.id).await?;
            }
            StoreEvent::Updated(Object::Task(task)) => {
                if task.is_terminal() {
                    self.handle_terminal(&task).await?;
                }
            }
            StoreEvent::Deleted(Object::Task(task)) => {
                // A deleted task may leave its slot empty; reconcile the
                // owning service if it still exists.
                let service = self
                    .store
                    .view(|tx| tx.get::<Service>(&task.service_id));
                if let Some(service) = service {
                    self.reconcile(&service, &HashSet::new()).await?;
                }
            }
            StoreEvent::Updated(Object::Node(node)) => {
                self.node_changed(&node).await?;
            }
            StoreEvent::Deleted(Object::Node(_)) => {
                self.reconcile_global_services().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drain due restarts and stalled update batches.
    async fn progress(&mut self) -> OrchestratorResult<()> {
        let due = self.restarts.due();
        if !due.is_empty() {
            let mut by_service: HashMap<String, HashSet<SlotKey>> = HashMap::new();
            for key in due {
                by_service
                    .entry(key.service_id.clone())
                    .or_default()
                    .insert(key);
            }
            for (service_id, keys) in by_service {
                let service = self.store.view(|tx| tx.get::<Service>(&service_id));
                if let Some(service) = service {
                    self.reconcile(&service, &keys).await?;
                }
            }
        }

        // Services mid-update get another pass once their batch delay
        // elapses.
        let stalled: Vec<String> = self
            .update_batches
            .iter()
            .filter(|(_, last)| {
                // Delay check happens inside reconcile; a coarse recheck
                // here avoids reconciling every service every tick.
                last.elapsed() >= Duration::from_millis(50)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for service_id in stalled {
            let service = self.store.view(|tx| tx.get::<Service>(&service_id));
            match service {
                Some(service) => self.reconcile(&service, &HashSet::new()).await?,
                None => {
                    self.update_batches.remove(&service_id);
                }
            }
        }
        Ok(())
    }

    /// Converge one service. `due` names slots whose restart delay has
    /// elapsed and may be refilled even though terminal tasks linger.
    pub async fn reconcile(
        &mut self,
        service: &Service,
        due: &HashSet<SlotKey>,
    ) -> OrchestratorResult<()> {
        match &service.spec.mode {
            ServiceMode::Replicated { replicas } => {
                self.reconcile_replicated(service, *replicas, due).await
            }
            ServiceMode::Global => self.reconcile_global(service, due).await,
            ServiceMode::Batch => self.reconcile_batch(service).await,
        }
    }

    async fn reconcile_replicated(
        &mut self,
        service: &Service,
        replicas: u64,
        due: &HashSet<SlotKey>,
    ) -> OrchestratorResult<()> {
        let tasks = self
            .store
            .view(|tx| tx.find::<Task>(&Filter::ByService(service.id.clone())));

        let mut slots: BTreeMap<u64, Vec<&Task>> = BTreeMap::new();
        for task in &tasks {
            slots.entry(task.slot).or_default().push(task);
        }

        let mut creates: Vec<Task> = Vec::new();
        let mut removals: Vec<String> = Vec::new();

        for slot in 1..=replicas {
            let slot_tasks = slots.get(&slot).map(Vec::as_slice).unwrap_or(&[]);
            let mut runnable: Vec<&&Task> =
                slot_tasks.iter().filter(|t| is_runnable(t)).collect();

            match runnable.len() {
                0 => {
                    let fresh_slot = slot_tasks.is_empty();
                    let slot_due = due.contains(&SlotKey {
                        service_id: service.id.clone(),
                        slot,
                        node_id: None,
                    });
                    // Brand-new slots fill immediately; slots that died
                    // wait for the restart supervisor.
                    if fresh_slot || slot_due {
                        creates.push(new_task(service, slot, None));
                    }
                }
                1 => {}
                _ => {
                    // Duplicate tasks in one slot: keep the most advanced,
                    // shed the rest, oldest first.
                    runnable.sort_by(|a, b| {
                        b.status
                            .state
                            .cmp(&a.status.state)
                            .then(b.meta.created_at.cmp(&a.meta.created_at))
                    });
                    for extra in &runnable[1..] {
                        removals.push(extra.id.clone());
                    }
                }
            }
        }

        // Slots beyond the declared count drain entirely.
        for (slot, slot_tasks) in &slots {
            if *slot > replicas || *slot == 0 {
                for task in slot_tasks.iter().filter(|t| is_runnable(t)) {
                    removals.push(task.id.clone());
                }
            }
        }

        // Rolling update: replace tasks stamped from an older spec.
        let outdated: Vec<&Task> = (1..=replicas)
            .filter_map(|slot| slots.get(&slot))
            .flatten()
            .filter(|t| is_runnable(t) && t.spec_version < service.meta.version)
            .copied()
            .collect();

        if !outdated.is_empty() {
            let update = service.spec.update.clone().unwrap_or_default();
            let batch_ready = match self.update_batches.get(&service.id) {
                Some(last) => last.elapsed() >= Duration::from_secs(update.delay_secs),
                None => true,
            };
            if batch_ready {
                let batch = if update.parallelism == 0 {
                    outdated.len()
                } else {
                    (update.parallelism as usize).min(outdated.len())
                };
                for task in outdated.iter().take(batch) {
                    removals.push(task.id.clone());
                    creates.push(new_task(service, task.slot, None));
                }
                self.update_batches.insert(service.id.clone(), Instant::now());
                debug!(
                    service_id = %service.id,
                    batch,
                    remaining = outdated.len() - batch,
                    "rolling update batch"
                );
            }
        } else {
            self.update_batches.remove(&service.id);
        }

        self.commit(service, creates, removals).await
    }

    async fn reconcile_global(
        &mut self,
        service: &Service,
        due: &HashSet<SlotKey>,
    ) -> OrchestratorResult<()> {
        let (nodes, tasks) = self.store.view(|tx| {
            (
                tx.find::<Node>(&Filter::All),
                tx.find::<Task>(&Filter::ByService(service.id.clone())),
            )
        });

        let eligible: HashSet<&str> = nodes
            .iter()
            .filter(|n| global_eligible(n))
            .map(|n| n.id.as_str())
            .collect();

        let mut by_node: HashMap<&str, Vec<&Task>> = HashMap::new();
        for task in &tasks {
            if let Some(node_id) = &task.node_id {
                by_node.entry(node_id.as_str()).or_default().push(task);
            }
        }

        let mut creates: Vec<Task> = Vec::new();
        let mut removals: Vec<String> = Vec::new();

        for node_id in &eligible {
            let node_tasks = by_node.get(node_id).map(Vec::as_slice).unwrap_or(&[]);
            let runnable = node_tasks.iter().filter(|t| is_runnable(t)).count();
            if runnable == 0 {
                let fresh = node_tasks.is_empty();
                let node_due = due.contains(&SlotKey {
                    service_id: service.id.clone(),
                    slot: 0,
                    node_id: Some(node_id.to_string()),
                });
                if fresh || node_due {
                    creates.push(new_task(service, 0, Some(node_id.to_string())));
                }
            }
        }

        // Tasks on nodes that left the eligible set drain.
        for (node_id, node_tasks) in &by_node {
            if !eligible.contains(node_id) {
                for task in node_tasks.iter().filter(|t| is_runnable(t)) {
                    removals.push(task.id.clone());
                }
            }
        }

        self.commit(service, creates, removals).await
    }

    /// Batch services run each task once; terminal tasks are never
    /// replaced, but a spec bump starts a fresh invocation.
    async fn reconcile_batch(&mut self, service: &Service) -> OrchestratorResult<()> {
        let tasks = self
            .store
            .view(|tx| tx.find::<Task>(&Filter::ByService(service.id.clone())));

        let runnable = tasks.iter().any(|t| is_runnable(t));
        if runnable {
            return Ok(());
        }

        let latest_version = tasks.iter().map(|t| t.spec_version).max();
        let creates = match latest_version {
            None => vec![new_task(service, 1, None)],
            Some(version) if version < service.meta.version => {
                vec![new_task(service, 1, None)]
            }
            Some(_) => Vec::new(),
        };
        self.commit(service, creates, Vec::new()).await
    }

    /// Apply a reconciliation plan in one transaction.
    async fn commit(
        &self,
        service: &Service,
        creates: Vec<Task>,
        removals: Vec<String>,
    ) -> OrchestratorResult<()> {
        if creates.is_empty() && removals.is_empty() {
            return Ok(());
        }
        debug!(
            service_id = %service.id,
            creates = creates.len(),
            removals = removals.len(),
            "reconciling service"
        );
        self.store
            .update(|tx| {
                for task in creates {
                    tx.create(task)?;
                }
                for task_id in &removals {
                    let Some(mut task) = tx.get::<Task>(task_id) else {
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

    /// A task stopped executing: decide whether to replace it.
    async fn handle_terminal(&mut self, task: &Task) -> OrchestratorResult<()> {
        if task.desired_state >= TaskState::Remove {
            return Ok(());
        }
        let service = self.store.view(|tx| tx.get::<Service>(&task.service_id));
        let Some(service) = service else {
            return Ok(());
        };
        if service.spec.mode == ServiceMode::Batch {
            return Ok(());
        }

        let policy = service.spec.task.restart.clone();
        if self.restarts.should_restart(task, &policy) {
            self.restarts.schedule(task, &policy);
        }
        Ok(())
    }

    async fn node_changed(&mut self, node: &Node) -> OrchestratorResult<()> {
        if node.status.state == NodeState::Down {
            self.orphan_node_tasks(&node.id).await?;
        }
        self.reconcile_global_services().await
    }

    /// Tasks stranded on a dead node jump to `Orphaned`; the terminal
    /// handler then replaces replicated tasks elsewhere, while global
    /// tasks stay pinned to the node key and are not recreated.
    async fn orphan_node_tasks(&self, node_id: &str) -> OrchestratorResult<()> {
        let stranded: Vec<String> = self.store.view(|tx| {
            tx.find::<Task>(&Filter::ByNode(node_id.to_string()))
                .into_iter()
                .filter(|t| !t.is_terminal())
                .map(|t| t.id)
                .collect()
        });
        if stranded.is_empty() {
            return Ok(());
        }

        info!(node_id, count = stranded.len(), "orphaning tasks on down node");
        self.store
            .update(|tx| {
                for task_id in &stranded {
                    let Some(mut task) = tx.get::<Task>(task_id) else {
                        continue;
                    };
                    if task.is_terminal() {
                        continue;
                    }
                    task.status.state = TaskState::Orphaned;
                    task.status.message = "node is down".to_string();
                    task.status.timestamp = epoch_secs();
                    tx.update(task)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reconcile_global_services(&mut self) -> OrchestratorResult<()> {
        let globals: Vec<Service> = self.store.view(|tx| {
            tx.find::<Service>(&Filter::All)
                .into_iter()
                .filter(|s| s.spec.mode == ServiceMode::Global)
                .collect()
        });
        for service in globals {
            self.reconcile(&service, &HashSet::new()).await?;
        }
        Ok(())
    }

    /// Tear down a deleted service's tasks: never-dispatched ones are
    /// deleted outright, the rest drain through the agent and reaper.
    async fn remove_service_tasks(&self, service_id: &str) -> OrchestratorResult<()> {
        let tasks = self
            .store
            .view(|tx| tx.find::<Task>(&Filter::ByService(service_id.to_string())));
        if tasks.is_empty() {
            return Ok(());
        }

        self.store
            .update(|tx| {
                for task in &tasks {
                    let Some(mut current) = tx.get::<Task>(&task.id) else {
                        continue;
                    };
                    if current.node_id.is_none() && current.status.state < TaskState::Assigned {
                        tx.delete::<Task>(&task.id)?;
                    } else if current.desired_state < TaskState::Remove {
                        current.desired_state = TaskState::Remove;
                        tx.update(current)?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// A task the reconcilers count toward the declared shape.
fn is_runnable(task: &Task) -> bool {
    !task.is_terminal() && task.desired_state < TaskState::Remove
}

/// Nodes a global service runs on.
fn global_eligible(node: &Node) -> bool {
    node.spec.availability == NodeAvailability::Active
        && node.spec.membership == NodeMembership::Accepted
        && node.status.state == NodeState::Ready
}

fn new_task(service: &Service, slot: u64, node_id: Option<String>) -> Task {
    Task {
        id: new_id(),
        meta: Default::default(),
        service_id: service.id.clone(),
        slot,
        node_id,
        spec: service.spec.task.clone(),
        spec_version: service.meta.version,
        desired_state: TaskState::Running,
        status: TaskStatus {
            state: TaskState::New,
            message: "created".to_string(),
            err: None,
            timestamp: epoch_secs(),
        },
        networks: Vec::new(),
        endpoint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{
        Annotations, Meta, NodeCertificate, NodeRole, NodeSpec, NodeStatus, RestartCondition,
        ServiceSpec, UpdateConfig,
    };

    fn replicated_service(id: &str, replicas: u64) -> Service {
        Service {
            id: id.into(),
            meta: Meta {
                annotations: Annotations::named(id),
                ..Meta::default()
            },
            spec: ServiceSpec {
                annotations: Annotations::named(id),
                mode: ServiceMode::Replicated { replicas },
                ..ServiceSpec::default()
            },
            endpoint: None,
        }
    }

    fn ready_node(id: &str) -> Node {
        Node {
            id: id.into(),
            meta: Meta::default(),
            role: NodeRole::Worker,
            spec: NodeSpec {
                annotations: Annotations::default(),
                availability: NodeAvailability::Active,
                membership: NodeMembership::Accepted,
            },
            description: None,
            status: NodeStatus {
                state: NodeState::Ready,
                message: String::new(),
            },
            certificate: NodeCertificate::default(),
            manager: None,
        }
    }

    async fn create_service(store: &Store, service: Service) -> Service {
        let id = service.id.clone();
        store.update(|tx| tx.create(service)).await.unwrap();
        store.view(|tx| tx.get::<Service>(&id)).unwrap()
    }

    fn runnable_tasks(store: &Store, service_id: &str) -> Vec<Task> {
        store.view(|tx| {
            tx.find::<Task>(&Filter::ByService(service_id.to_string()))
                .into_iter()
                .filter(is_runnable)
                .collect()
        })
    }

    #[tokio::test]
    async fn replicated_scale_up_fills_slots() {
        let store = Store::new();
        let service = create_service(&store, replicated_service("s1", 3)).await;

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();

        let tasks = runnable_tasks(&store, "s1");
        assert_eq!(tasks.len(), 3);
        let mut slots: Vec<u64> = tasks.iter().map(|t| t.slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![1, 2, 3]);
        assert!(tasks.iter().all(|t| t.desired_state == TaskState::Running));
        assert!(tasks.iter().all(|t| t.status.state == TaskState::New));
    }

    #[tokio::test]
    async fn replicated_scale_up_adds_missing_slot() {
        let store = Store::new();
        let service = create_service(&store, replicated_service("s1", 2)).await;
        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "s1").len(), 2);

        // Scale to 3: one new task in slot 3, existing tasks untouched.
        let mut updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();
        updated.spec.mode = ServiceMode::Replicated { replicas: 3 };
        store
            .update(|tx| tx.update(updated.clone()))
            .await
            .unwrap();
        let updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();

        // Stamp existing tasks to the new spec version so the update
        // path stays quiet and only the deficit fills.
        let existing = runnable_tasks(&store, "s1");
        store
            .update(|tx| {
                for mut t in existing {
                    t.spec_version = updated.meta.version;
                    tx.update(t)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        orch.reconcile(&updated, &HashSet::new()).await.unwrap();
        let tasks = runnable_tasks(&store, "s1");
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().any(|t| t.slot == 3));
    }

    #[tokio::test]
    async fn replicated_scale_down_drains_high_slots() {
        let store = Store::new();
        let service = create_service(&store, replicated_service("s1", 3)).await;
        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();

        let mut updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();
        updated.spec.mode = ServiceMode::Replicated { replicas: 1 };
        store
            .update(|tx| tx.update(updated.clone()))
            .await
            .unwrap();
        let updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();

        let existing = runnable_tasks(&store, "s1");
        store
            .update(|tx| {
                for mut t in existing {
                    t.spec_version = updated.meta.version;
                    tx.update(t)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        orch.reconcile(&updated, &HashSet::new()).await.unwrap();

        let tasks = store.view(|tx| tx.find::<Task>(&Filter::ByService("s1".into())));
        let removed: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.desired_state == TaskState::Remove)
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|t| t.slot > 1));
        assert_eq!(runnable_tasks(&store, "s1").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_slot_keeps_most_advanced() {
        let store = Store::new();
        let service = create_service(&store, replicated_service("s1", 1)).await;

        // Two tasks in slot 1, one further along than the other.
        let mut ahead = new_task(&service, 1, None);
        ahead.id = "t-ahead".into();
        ahead.status.state = TaskState::Running;
        let mut behind = new_task(&service, 1, None);
        behind.id = "t-behind".into();
        behind.status.state = TaskState::Assigned;
        store
            .update(|tx| {
                tx.create(ahead)?;
                tx.create(behind)
            })
            .await
            .unwrap();

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();

        let ahead = store.view(|tx| tx.get::<Task>("t-ahead")).unwrap();
        let behind = store.view(|tx| tx.get::<Task>("t-behind")).unwrap();
        assert_eq!(ahead.desired_state, TaskState::Running);
        assert_eq!(behind.desired_state, TaskState::Remove);
    }

    #[tokio::test]
    async fn failed_slot_waits_for_restart_supervisor() {
        let store = Store::new();
        let mut service = replicated_service("s1", 1);
        service.spec.task.restart.condition = RestartCondition::OnFailure;
        let service = create_service(&store, service).await;

        let mut task = new_task(&service, 1, Some("n1".into()));
        task.id = "t1".into();
        task.status.state = TaskState::Failed;
        store.update(|tx| tx.create(task)).await.unwrap();

        let mut orch = Orchestrator::new(store.clone());
        // Plain reconcile must not refill a slot with terminal history.
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "s1").len(), 0);

        // With the slot due, a replacement appears.
        let failed = store.view(|tx| tx.get::<Task>("t1")).unwrap();
        let mut due = HashSet::new();
        due.insert(SlotKey::for_task(&failed));
        orch.reconcile(&service, &due).await.unwrap();

        let tasks = runnable_tasks(&store, "s1");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].slot, 1);
        assert_ne!(tasks[0].id, "t1");
    }

    #[tokio::test]
    async fn terminal_task_schedules_restart() {
        let store = Store::new();
        let mut service = replicated_service("s1", 1);
        service.spec.task.restart.condition = RestartCondition::OnFailure;
        service.spec.task.restart.delay_ms = 0;
        let service = create_service(&store, service).await;

        let mut task = new_task(&service, 1, Some("n1".into()));
        task.status.state = TaskState::Failed;
        let task_id = task.id.clone();
        store.update(|tx| tx.create(task)).await.unwrap();

        let mut orch = Orchestrator::new(store.clone());
        let failed = store.view(|tx| tx.get::<Task>(&task_id)).unwrap();
        orch.handle_terminal(&failed).await.unwrap();
        assert_eq!(orch.restarts.pending_len(), 1);

        orch.progress().await.unwrap();
        assert_eq!(runnable_tasks(&store, "s1").len(), 1);
    }

    #[tokio::test]
    async fn rolling_update_respects_parallelism() {
        let store = Store::new();
        let mut service = replicated_service("s1", 4);
        service.spec.update = Some(UpdateConfig {
            parallelism: 2,
            delay_secs: 3600,
        });
        let service = create_service(&store, service).await;

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "s1").len(), 4);

        // Bump the spec; existing tasks are now outdated.
        let mut updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();
        updated.spec.task.container.image = "app:v2".into();
        store
            .update(|tx| tx.update(updated.clone()))
            .await
            .unwrap();
        let updated = store.view(|tx| tx.get::<Service>("s1")).unwrap();

        orch.reconcile(&updated, &HashSet::new()).await.unwrap();

        let tasks = store.view(|tx| tx.find::<Task>(&Filter::ByService("s1".into())));
        let draining = tasks
            .iter()
            .filter(|t| t.desired_state == TaskState::Remove)
            .count();
        let fresh = tasks
            .iter()
            .filter(|t| t.spec_version == updated.meta.version && is_runnable(t))
            .count();
        // Exactly one batch of two replaced; the delay gates the rest.
        assert_eq!(draining, 2);
        assert_eq!(fresh, 2);

        // Within the delay window a second pass changes nothing.
        orch.reconcile(&updated, &HashSet::new()).await.unwrap();
        let tasks = store.view(|tx| tx.find::<Task>(&Filter::ByService("s1".into())));
        assert_eq!(
            tasks
                .iter()
                .filter(|t| t.desired_state == TaskState::Remove)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn global_runs_one_task_per_eligible_node() {
        let store = Store::new();
        store
            .update(|tx| {
                tx.create(ready_node("n1"))?;
                tx.create(ready_node("n2"))?;
                let mut draining = ready_node("n3");
                draining.spec.availability = NodeAvailability::Drain;
                tx.create(draining)
            })
            .await
            .unwrap();

        let mut service = replicated_service("g1", 0);
        service.spec.mode = ServiceMode::Global;
        let service = create_service(&store, service).await;

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();

        let tasks = runnable_tasks(&store, "g1");
        assert_eq!(tasks.len(), 2);
        let nodes: HashSet<_> = tasks.iter().filter_map(|t| t.node_id.clone()).collect();
        assert!(nodes.contains("n1") && nodes.contains("n2"));
        assert!(tasks.iter().all(|t| t.slot == 0));
    }

    #[tokio::test]
    async fn global_drains_ineligible_nodes() {
        let store = Store::new();
        store
            .update(|tx| tx.create(ready_node("n1")))
            .await
            .unwrap();

        let mut service = replicated_service("g1", 0);
        service.spec.mode = ServiceMode::Global;
        let service = create_service(&store, service).await;

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "g1").len(), 1);

        let mut node = store.view(|tx| tx.get::<Node>("n1")).unwrap();
        node.spec.availability = NodeAvailability::Drain;
        store.update(|tx| tx.update(node)).await.unwrap();

        let service = store.view(|tx| tx.get::<Service>("g1")).unwrap();
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "g1").len(), 0);
    }

    #[tokio::test]
    async fn batch_tasks_are_not_replaced() {
        let store = Store::new();
        let mut service = replicated_service("b1", 0);
        service.spec.mode = ServiceMode::Batch;
        let service = create_service(&store, service).await;

        let mut orch = Orchestrator::new(store.clone());
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        let tasks = runnable_tasks(&store, "b1");
        assert_eq!(tasks.len(), 1);
        let task_id = tasks[0].id.clone();

        // Completes; no replacement.
        let mut done = store.view(|tx| tx.get::<Task>(&task_id)).unwrap();
        done.status.state = TaskState::Completed;
        store.update(|tx| tx.update(done)).await.unwrap();

        let done = store.view(|tx| tx.get::<Task>(&task_id)).unwrap();
        orch.handle_terminal(&done).await.unwrap();
        assert_eq!(orch.restarts.pending_len(), 0);

        let service = store.view(|tx| tx.get::<Service>("b1")).unwrap();
        orch.reconcile(&service, &HashSet::new()).await.unwrap();
        assert_eq!(runnable_tasks(&store, "b1").len(), 0);
    }

    #[tokio::test]
    async fn node_down_orphans_tasks() {
        let store = Store::new();
        store
            .update(|tx| tx.create(ready_node("n1")))
            .await
            .unwrap();
        let service = create_service(&store, replicated_service("s1", 1)).await;

        let mut task = new_task(&service, 1, Some("n1".into()));
        task.id = "t1".into();
        task.status.state = TaskState::Running;
        store.update(|tx| tx.create(task)).await.unwrap();

        let mut orch = Orchestrator::new(store.clone());
        let mut node = store.view(|tx| tx.get::<Node>("n1")).unwrap();
        node.status.state = NodeState::Down;
        store.update(|tx| tx.update(node.clone())).await.unwrap();
        let node = store.view(|tx| tx.get::<Node>("n1")).unwrap();
        orch.node_changed(&node).await.unwrap();

        let task = store.view(|tx| tx.get::<Task>("t1")).unwrap();
        assert_eq!(task.status.state, TaskState::Orphaned);
        assert!(task.is_terminal());
    }

    #[tokio::test]
    async fn service_deletion_cleans_up_tasks() {
        let store = Store::new();
        let service = create_service(&store, replicated_service("s1", 2)).await;

        // One dispatched task, one never dispatched.
        let mut dispatched = new_task(&service, 1, Some("n1".into()));
        dispatched.id = "t-live".into();
        dispatched.status.state = TaskState::Running;
        let mut fresh = new_task(&service, 2, None);
        fresh.id = "t-fresh".into();
        store
            .update(|tx| {
                tx.create(dispatched)?;
                tx.create(fresh)
            })
            .await
            .unwrap();

        let orch = Orchestrator::new(store.clone());
        orch.remove_service_tasks("s1").await.unwrap();

        assert!(store.view(|tx| tx.get::<Task>("t-fresh")).is_none());
        let live = store.view(|tx| tx.get::<Task>("t-live")).unwrap();
        assert_eq!(live.desired_state, TaskState::Remove);
    }
}
