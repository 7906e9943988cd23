//! Assignment handling and per-task controller management.
//!
//! The worker owns the controller map; only the session loop touches
//! it. Controllers run on their own tasks and publish state through the
//! status reporter, so nothing here blocks on the runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_store::{Task, TaskState};

use crate::exec::{drive, Executor};
use crate::reporter::StatusReporter;

struct TaskHandle {
    cancel: watch::Sender<bool>,
    updates: mpsc::Sender<Task>,
    join: JoinHandle<()>,
}

pub struct Worker {
    executor: Arc<dyn Executor>,
    reporter: StatusReporter,
    /// Last seen assignment per task, for change detection.
    tasks: HashMap<String, Task>,
    handles: HashMap<String, TaskHandle>,
}

impl Worker {
    pub fn new(executor: Arc<dyn Executor>, reporter: StatusReporter) -> Self {
        Self {
            executor,
            reporter,
            tasks: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    /// Apply a full assignment set: anything we run that is absent from
    /// the set shuts down.
    pub async fn assign_full(&mut self, assigned: Vec<Task>) {
        let keep: HashSet<String> = assigned.iter().map(|t| t.id.clone()).collect();
        let gone: Vec<String> = self
            .tasks
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for task_id in gone {
            self.release(&task_id);
        }
        for task in assigned {
            self.assign_one(task).await;
        }
        self.reap_finished();
    }

    /// Apply an incremental delta.
    pub async fn assign_delta(&mut self, updated: Vec<Task>, removed: Vec<String>) {
        for task_id in removed {
            self.release(&task_id);
        }
        for task in updated {
            self.assign_one(task).await;
        }
        self.reap_finished();
    }

    /// Tasks currently managed.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn running_controllers(&self) -> usize {
        self.handles.len()
    }

    async fn assign_one(&mut self, task: Task) {
        match self.tasks.get(&task.id) {
            None => {
                debug!(task_id = %task.id, "accepting task");
                self.accept(task).await;
            }
            Some(known) if known.spec != task.spec => {
                debug!(task_id = %task.id, "propagating task update");
                if let Some(handle) = self.handles.get(&task.id) {
                    if handle.updates.send(task.clone()).await.is_err() {
                        warn!(task_id = %task.id, "controller gone; update dropped");
                    }
                }
                self.tasks.insert(task.id.clone(), task);
            }
            Some(_) => {
                // Re-delivery of a known assignment; nothing to do.
                self.tasks.insert(task.id.clone(), task);
            }
        }
    }

    async fn accept(&mut self, task: Task) {
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), task.clone());

        self.reporter
            .report(&task_id, TaskState::Accepted, None)
            .await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::channel(4);
        let executor = Arc::clone(&self.executor);
        let reporter = self.reporter.clone();

        let join = tokio::spawn(async move {
            run_task(task, executor, reporter, cancel_rx, update_rx).await;
        });

        self.handles.insert(
            task_id,
            TaskHandle {
                cancel: cancel_tx,
                updates: update_tx,
                join,
            },
        );
    }

    /// Begin teardown for a task that left the assignment set. The
    /// controller shuts the task down, reports the terminal state, and
    /// releases its resources; the handle is reaped once it finishes.
    fn release(&mut self, task_id: &str) {
        self.tasks.remove(task_id);
        if let Some(handle) = self.handles.get(task_id) {
            info!(task_id, "assignment withdrawn; shutting task down");
            let _ = handle.cancel.send(true);
        }
    }

    fn reap_finished(&mut self) {
        self.handles.retain(|_, handle| !handle.join.is_finished());
    }

    /// Cancel everything and wait for controllers to wind down.
    pub async fn shutdown(&mut self) {
        for handle in self.handles.values() {
            let _ = handle.cancel.send(true);
        }
        for (_, handle) in self.handles.drain() {
            let _ = handle.join.await;
        }
        self.tasks.clear();
    }
}

async fn run_task(
    task: Task,
    executor: Arc<dyn Executor>,
    reporter: StatusReporter,
    cancel: watch::Receiver<bool>,
    updates: mpsc::Receiver<Task>,
) {
    let task_id = task.id.clone();

    let mut ctlr = match executor.controller(&task).await {
        Ok(ctlr) => ctlr,
        Err(err) => {
            warn!(%task_id, error = %err, "controller resolution failed");
            reporter
                .report(&task_id, TaskState::Rejected, Some(err.message))
                .await;
            return;
        }
    };

    let state_reporter = reporter.clone();
    let report_id = task_id.clone();
    let outcome = drive(ctlr.as_mut(), cancel, updates, move |state| {
        state_reporter.try_report(&report_id, state, None);
    })
    .await;

    reporter
        .report(
            &task_id,
            outcome.state(),
            outcome.error().map(String::from),
        )
        .await;

    if let Err(err) = ctlr.remove().await {
        warn!(%task_id, error = %err, "resource release failed");
    }
    debug!(%task_id, state = %outcome.state(), "task controller finished");
}
