//! Task reaper.
//!
//! Two jobs: delete tasks whose desired state is `Remove` once the agent
//! has reported a terminal state (the deletion handshake), and trim the
//! terminal-task history kept per service slot to the cluster's
//! retention limit.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_store::{
    Filter, Kind, Object, Store, StoreEvent, Task, TaskState, WatchError,
};

use crate::error::OrchestratorResult;

/// Terminal tasks kept per slot when the cluster does not say otherwise.
const DEFAULT_HISTORY_LIMIT: u64 = 5;

pub struct TaskReaper {
    store: Store,
}

impl TaskReaper {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run until shutdown, reacting to task updates.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> OrchestratorResult<()> {
        let mut events = self.store.watch_where(|e| e.kind() == Kind::Task);

        // Catch up on anything that became reapable while no leader ran.
        self.sweep().await?;
        info!("task reaper started");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Ok(StoreEvent::Updated(Object::Task(task))) => {
                        if let Err(err) = self.task_updated(&task).await {
                            warn!(error = %err, task_id = %task.id, "reap failed");
                        }
                    }
                    Ok(_) => {}
                    Err(WatchError::Lagged(n)) => {
                        warn!(missed = n, "reaper lagged; sweeping");
                        events = self.store.watch_where(|e| e.kind() == Kind::Task);
                        self.sweep().await?;
                    }
                    Err(WatchError::Closed) => return Ok(()),
                },
                _ = shutdown.changed() => {
                    info!("task reaper shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Full pass over every task.
    pub async fn sweep(&self) -> OrchestratorResult<()> {
        let tasks = self.store.view(|tx| tx.find::<Task>(&Filter::All));

        let mut deletions: Vec<String> = Vec::new();
        let mut slots: BTreeMap<(String, u64), Vec<&Task>> = BTreeMap::new();

        for task in &tasks {
            if removal_acknowledged(task) {
                deletions.push(task.id.clone());
            } else if task.is_terminal() {
                slots
                    .entry((task.service_id.clone(), task.slot))
                    .or_default()
                    .push(task);
            }
        }
        for history in slots.into_values() {
            deletions.extend(excess_history(history, self.history_limit()));
        }

        self.delete(deletions).await
    }

    async fn task_updated(&self, task: &Task) -> OrchestratorResult<()> {
        if removal_acknowledged(task) {
            debug!(task_id = %task.id, state = %task.status.state, "removing acknowledged task");
            return self.delete(vec![task.id.clone()]).await;
        }

        if task.is_terminal() {
            // A slot just gained a terminal task; trim its history.
            let history: Vec<Task> = self.store.view(|tx| {
                tx.find::<Task>(&Filter::BySlot {
                    service_id: task.service_id.clone(),
                    slot: task.slot,
                })
                .into_iter()
                .filter(|t| t.is_terminal() && !removal_acknowledged(t))
                .collect()
            });
            let doomed = excess_history(history.iter().collect(), self.history_limit());
            return self.delete(doomed).await;
        }
        Ok(())
    }

    async fn delete(&self, task_ids: Vec<String>) -> OrchestratorResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        self.store
            .update(|tx| {
                for task_id in &task_ids {
                    if tx.get::<Task>(task_id).is_some() {
                        tx.delete::<Task>(task_id)?;
                    }
                }
                Ok(())
            })
            .await?;
        debug!(count = task_ids.len(), "tasks reaped");
        Ok(())
    }

    fn history_limit(&self) -> u64 {
        self.store
            .view(|tx| tx.cluster())
            .map(|c| c.spec.task_history_limit)
            .filter(|&limit| limit > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// The agent finished shutting the task down and the operator wants it
/// gone.
fn removal_acknowledged(task: &Task) -> bool {
    task.desired_state >= TaskState::Remove && task.is_terminal()
}

/// Ids of terminal tasks beyond the newest `limit`, oldest first.
fn excess_history(mut history: Vec<&Task>, limit: u64) -> Vec<String> {
    if history.len() as u64 <= limit {
        return Vec::new();
    }
    // Newest first by commit version; ties broken by id for determinism.
    history.sort_by(|a, b| {
        b.meta
            .version
            .cmp(&a.meta.version)
            .then_with(|| a.id.cmp(&b.id))
    });
    history
        .into_iter()
        .skip(limit as usize)
        .map(|t| t.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{Meta, TaskSpec, TaskStatus};

    fn task(id: &str, service: &str, slot: u64, state: TaskState, desired: TaskState) -> Task {
        Task {
            id: id.into(),
            meta: Meta::default(),
            service_id: service.into(),
            slot,
            node_id: Some("n1".into()),
            spec: TaskSpec::default(),
            spec_version: 1,
            desired_state: desired,
            status: TaskStatus {
                state,
                ..TaskStatus::default()
            },
            networks: Vec::new(),
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn acknowledged_removals_are_deleted() {
        let store = Store::new();
        store
            .update(|tx| {
                tx.create(task("t1", "s1", 1, TaskState::Shutdown, TaskState::Remove))?;
                tx.create(task("t2", "s1", 2, TaskState::Running, TaskState::Remove))
            })
            .await
            .unwrap();

        let reaper = TaskReaper::new(store.clone());
        reaper.sweep().await.unwrap();

        // Shutdown + Remove is reaped; still-running task must wait for
        // the agent's terminal report.
        assert!(store.view(|tx| tx.get::<Task>("t1")).is_none());
        assert!(store.view(|tx| tx.get::<Task>("t2")).is_some());
    }

    #[tokio::test]
    async fn removal_completes_after_agent_ack() {
        let store = Store::new();
        store
            .update(|tx| tx.create(task("t1", "s1", 1, TaskState::Running, TaskState::Remove)))
            .await
            .unwrap();

        let reaper = TaskReaper::new(store.clone());
        let mut shut = store.view(|tx| tx.get::<Task>("t1")).unwrap();
        shut.status.state = TaskState::Shutdown;
        store.update(|tx| tx.update(shut)).await.unwrap();

        let updated = store.view(|tx| tx.get::<Task>("t1")).unwrap();
        reaper.task_updated(&updated).await.unwrap();
        assert!(store.view(|tx| tx.get::<Task>("t1")).is_none());
    }

    #[tokio::test]
    async fn history_trimmed_to_cluster_limit() {
        let store = Store::new();
        let mut cluster = flotilla_store::Cluster {
            id: "c1".into(),
            meta: Meta::default(),
            spec: Default::default(),
            root_ca: Default::default(),
        };
        cluster.spec.task_history_limit = 2;
        store.update(|tx| tx.create(cluster)).await.unwrap();

        // Five terminal tasks in one slot, created over five commits so
        // versions are distinct.
        for i in 0..5 {
            let t = task(
                &format!("t{i}"),
                "s1",
                1,
                TaskState::Failed,
                TaskState::Running,
            );
            store.update(|tx| tx.create(t)).await.unwrap();
        }

        let reaper = TaskReaper::new(store.clone());
        reaper.sweep().await.unwrap();

        let remaining = store.view(|tx| {
            tx.find::<Task>(&Filter::BySlot {
                service_id: "s1".into(),
                slot: 1,
            })
        });
        assert_eq!(remaining.len(), 2);
        // Newest survive.
        let ids: Vec<&str> = remaining.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"t3") && ids.contains(&"t4"));
    }

    #[tokio::test]
    async fn running_tasks_never_reaped_by_history() {
        let store = Store::new();
        for i in 0..8 {
            let t = task(
                &format!("t{i}"),
                "s1",
                1,
                TaskState::Running,
                TaskState::Running,
            );
            store.update(|tx| tx.create(t)).await.unwrap();
        }

        let reaper = TaskReaper::new(store.clone());
        reaper.sweep().await.unwrap();
        assert_eq!(store.view(|tx| tx.count::<Task>()), 8);
    }
}
