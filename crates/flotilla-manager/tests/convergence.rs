//! Control-loop convergence against a shared in-process store.
//!
//! Wires the orchestrator, allocator, scheduler and reaper to one store
//! (no Raft, no network) and plays operator actions plus simulated
//! agent reports through it, asserting the declared-state invariants:
//! replica convergence, drain evacuation, removal handshakes.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;

use flotilla_allocator::Allocator;
use flotilla_manager::bootstrap_cluster;
use flotilla_orchestrator::{Orchestrator, TaskReaper};
use flotilla_scheduler::Scheduler;
use flotilla_store::{
    new_id, Annotations, ContainerSpec, Filter, Meta, Node, NodeAvailability, NodeCertificate,
    NodeMembership, NodeRole, NodeSpec, NodeState, NodeStatus, Service, ServiceMode, ServiceSpec,
    Store, Task, TaskSpec, TaskState,
};

struct Harness {
    store: Store,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> Self {
        let store = Store::new();
        bootstrap_cluster(&store, "test", None).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Orchestrator::new(store.clone()).run(shutdown_rx.clone()));
        tokio::spawn(Allocator::new(store.clone()).run(shutdown_rx.clone()));
        tokio::spawn(Scheduler::new(store.clone()).run(shutdown_rx.clone()));
        tokio::spawn(TaskReaper::new(store.clone()).run(shutdown_rx.clone()));

        Self {
            store,
            _shutdown: shutdown_tx,
        }
    }

    async fn add_node(&self, id: &str) {
        let node = Node {
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
        };
        self.store.update(|tx| tx.create(node)).await.unwrap();
    }

    async fn create_service(&self, name: &str, replicas: u64) -> String {
        let service = Service {
            id: new_id(),
            meta: Meta {
                annotations: Annotations::named(name),
                ..Meta::default()
            },
            spec: ServiceSpec {
                annotations: Annotations::named(name),
                task: TaskSpec {
                    container: ContainerSpec {
                        image: "app:v1".into(),
                        ..ContainerSpec::default()
                    },
                    ..TaskSpec::default()
                },
                mode: ServiceMode::Replicated { replicas },
                update: None,
                endpoint: None,
            },
            endpoint: None,
        };
        let id = service.id.clone();
        self.store.update(|tx| tx.create(service)).await.unwrap();
        id
    }

    async fn scale(&self, service_id: &str, replicas: u64) {
        let mut service = self
            .store
            .view(|tx| tx.get::<Service>(service_id))
            .unwrap();
        service.spec.mode = ServiceMode::Replicated { replicas };
        self.store.update(|tx| tx.update(service)).await.unwrap();
        // Keep existing tasks on the current spec version so the update
        // machinery stays out of pure scaling tests.
        let tasks = self.tasks(service_id);
        let version = self
            .store
            .view(|tx| tx.get::<Service>(service_id))
            .unwrap()
            .meta
            .version;
        self.store
            .update(|tx| {
                for task in tasks {
                    if let Some(mut fresh) = tx.get::<Task>(&task.id) {
                        fresh.spec_version = version;
                        tx.update(fresh)?;
                    }
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    fn tasks(&self, service_id: &str) -> Vec<Task> {
        self.store
            .view(|tx| tx.find::<Task>(&Filter::ByService(service_id.to_string())))
    }

    fn runnable(&self, service_id: &str) -> Vec<Task> {
        self.tasks(service_id)
            .into_iter()
            .filter(|t| !t.is_terminal() && t.desired_state < TaskState::Remove)
            .collect()
    }

    /// Play the agent: advance every assigned runnable task to Running
    /// and shut down tasks whose desired state is Remove.
    async fn simulate_agents(&self) {
        let tasks = self.store.view(|tx| tx.find::<Task>(&Filter::All));
        self.store
            .update(|tx| {
                for task in &tasks {
                    let Some(mut fresh) = tx.get::<Task>(&task.id) else {
                        continue;
                    };
                    if fresh.node_id.is_none() {
                        continue;
                    }
                    if fresh.desired_state >= TaskState::Remove && !fresh.is_terminal() {
                        fresh.status.state = TaskState::Shutdown;
                        tx.update(fresh)?;
                    } else if fresh.desired_state == TaskState::Running
                        && fresh.status.state >= TaskState::Assigned
                        && fresh.status.state < TaskState::Running
                    {
                        fresh.status.state = TaskState::Running;
                        tx.update(fresh)?;
                    }
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    /// Run the agent simulation until the predicate holds or time runs out.
    async fn converge<F>(&self, what: &str, predicate: F)
    where
        F: Fn(&Store) -> bool,
    {
        for _ in 0..100 {
            if predicate(&self.store) {
                return;
            }
            self.simulate_agents().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("did not converge: {what}");
    }
}

#[tokio::test]
async fn replicated_service_converges_to_declared_count() {
    let harness = Harness::start().await;
    harness.add_node("n1").await;
    harness.add_node("n2").await;
    let service_id = harness.create_service("web", 2).await;

    let sid = service_id.clone();
    harness
        .converge("2 running tasks on distinct slots", move |store| {
            let tasks: Vec<Task> = store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .into_iter()
                .filter(|t| t.status.state == TaskState::Running)
                .collect();
            let slots: HashSet<u64> = tasks.iter().map(|t| t.slot).collect();
            tasks.len() == 2 && slots == HashSet::from([1, 2])
        })
        .await;

    // Scale up: a third slot appears.
    harness.scale(&service_id, 3).await;
    let sid = service_id.clone();
    harness
        .converge("3rd task in slot 3", move |store| {
            store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .iter()
                .any(|t| t.slot == 3 && t.status.state == TaskState::Running)
        })
        .await;
}

#[tokio::test]
async fn scale_down_removes_and_reaps_excess_tasks() {
    let harness = Harness::start().await;
    harness.add_node("n1").await;
    let service_id = harness.create_service("web", 3).await;

    let sid = service_id.clone();
    harness
        .converge("3 running tasks", move |store| {
            store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .iter()
                .filter(|t| t.status.state == TaskState::Running)
                .count()
                == 3
        })
        .await;

    harness.scale(&service_id, 1).await;

    // Excess tasks drain through Remove → Shutdown → deletion, leaving
    // exactly one task total.
    let sid = service_id.clone();
    harness
        .converge("exactly one task remains", move |store| {
            let tasks = store.view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())));
            tasks.len() == 1 && tasks[0].status.state == TaskState::Running
        })
        .await;
}

#[tokio::test]
async fn drained_node_is_evacuated() {
    let harness = Harness::start().await;
    harness.add_node("w1").await;
    harness.add_node("w2").await;
    let service_id = harness.create_service("web", 2).await;

    let sid = service_id.clone();
    harness
        .converge("both tasks running", move |store| {
            store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .iter()
                .filter(|t| t.status.state == TaskState::Running)
                .count()
                == 2
        })
        .await;

    // Drain w1.
    let mut node = harness.store.view(|tx| tx.get::<Node>("w1")).unwrap();
    node.spec.availability = NodeAvailability::Drain;
    harness.store.update(|tx| tx.update(node)).await.unwrap();

    // All runnable tasks end up on w2, still honoring slot uniqueness.
    let sid = service_id.clone();
    harness
        .converge("w1 empty, w2 carries both slots", move |store| {
            let runnable: Vec<Task> = store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .into_iter()
                .filter(|t| {
                    !t.is_terminal()
                        && t.desired_state < TaskState::Remove
                        && t.status.state == TaskState::Running
                })
                .collect();
            let slots: HashSet<u64> = runnable.iter().map(|t| t.slot).collect();
            runnable.len() == 2
                && slots.len() == 2
                && runnable.iter().all(|t| t.node_id.as_deref() == Some("w2"))
        })
        .await;
}

#[tokio::test]
async fn down_node_tasks_are_replaced_elsewhere() {
    let harness = Harness::start().await;
    harness.add_node("w1").await;
    harness.add_node("w2").await;
    let service_id = harness.create_service("web", 2).await;

    let sid = service_id.clone();
    harness
        .converge("both tasks running", move |store| {
            store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .iter()
                .filter(|t| t.status.state == TaskState::Running)
                .count()
                == 2
        })
        .await;

    // w1 stops heartbeating: the dispatcher would mark it down; here we
    // write the transition directly.
    let mut node = harness.store.view(|tx| tx.get::<Node>("w1")).unwrap();
    node.status.state = NodeState::Down;
    harness.store.update(|tx| tx.update(node)).await.unwrap();

    let sid = service_id.clone();
    harness
        .converge("replacements running on w2", move |store| {
            let running: Vec<Task> = store
                .view(|tx| tx.find::<Task>(&Filter::ByService(sid.clone())))
                .into_iter()
                .filter(|t| {
                    t.status.state == TaskState::Running
                        && t.desired_state < TaskState::Remove
                })
                .collect();
            running.len() == 2
                && running.iter().all(|t| t.node_id.as_deref() == Some("w2"))
        })
        .await;
}

#[tokio::test]
async fn runnable_never_exceeds_declared_plus_updates() {
    let harness = Harness::start().await;
    harness.add_node("n1").await;
    let service_id = harness.create_service("web", 2).await;

    for _ in 0..20 {
        harness.simulate_agents().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let runnable = harness.runnable(&service_id);
        assert!(
            runnable.len() <= 2,
            "runnable task count exceeded declared replicas: {}",
            runnable.len()
        );
    }
}
