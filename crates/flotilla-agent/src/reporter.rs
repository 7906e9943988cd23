//! Status reporting pipeline.
//!
//! Controllers push observed state changes onto a bounded queue; one
//! drain task coalesces them (latest per task), enforces the
//! never-regress rule locally, and sends batches to the dispatcher,
//! retrying with exponential backoff. An acknowledgement lets the
//! pending report for that task be dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use flotilla_store::{epoch_secs, TaskState, TaskStatus};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Where reports go: the live dispatcher session, or a test double.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Send a batch; returns the task ids the manager accepted.
    async fn send(
        &self,
        updates: Vec<(String, TaskStatus)>,
    ) -> Result<Vec<String>, tonic::Status>;
}

/// Handle controllers use to emit state changes.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::Sender<(String, TaskStatus)>,
}

impl StatusReporter {
    /// Create the reporter and spawn its drain task.
    pub fn start(
        sink: Arc<dyn StatusSink>,
        queue_depth: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        tokio::spawn(drain(rx, sink, shutdown));
        Self { tx }
    }

    /// Report a state change. Blocks only when the queue is full, which
    /// back-pressures controllers rather than dropping reports.
    pub async fn report(&self, task_id: &str, state: TaskState, err: Option<String>) {
        let status = TaskStatus {
            state,
            message: String::new(),
            err,
            timestamp: epoch_secs(),
        };
        if self.tx.send((task_id.to_string(), status)).await.is_err() {
            warn!(task_id, "status queue closed; report dropped");
        }
    }

    /// Synchronous variant for non-async call sites; drops on a full
    /// queue instead of waiting.
    pub fn try_report(&self, task_id: &str, state: TaskState, err: Option<String>) {
        let status = TaskStatus {
            state,
            message: String::new(),
            err,
            timestamp: epoch_secs(),
        };
        if self.tx.try_send((task_id.to_string(), status)).is_err() {
            warn!(task_id, "status queue full; report dropped");
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<(String, TaskStatus)>,
    sink: Arc<dyn StatusSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Last state sent per task, for local regression filtering.
    let mut sent: HashMap<String, TaskState> = HashMap::new();
    // Reports awaiting a successful send, latest per task.
    let mut pending: HashMap<String, TaskStatus> = HashMap::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        // Pull everything available before flushing.
        tokio::select! {
            report = rx.recv() => {
                let Some((task_id, status)) = report else { return };
                accept(&mut pending, &sent, task_id, status);
                while let Ok((task_id, status)) = rx.try_recv() {
                    accept(&mut pending, &sent, task_id, status);
                }
            }
            _ = shutdown.changed() => return,
        }

        while !pending.is_empty() {
            let batch: Vec<(String, TaskStatus)> = pending
                .iter()
                .map(|(id, status)| (id.clone(), status.clone()))
                .collect();

            match sink.send(batch).await {
                Ok(acked) => {
                    for task_id in acked {
                        if let Some(status) = pending.remove(&task_id) {
                            sent.insert(task_id, status.state);
                        }
                    }
                    backoff = INITIAL_BACKOFF;
                }
                Err(status) => {
                    warn!(error = %status, retry_in = ?backoff, "status send failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    // Absorb anything that queued while backing off.
                    while let Ok((task_id, status)) = rx.try_recv() {
                        accept(&mut pending, &sent, task_id, status);
                    }
                }
            }
        }
    }
}

/// Merge a report into the pending set, applying the monotonic rule
/// against both the pending value and the last acknowledged state.
fn accept(
    pending: &mut HashMap<String, TaskStatus>,
    sent: &HashMap<String, TaskState>,
    task_id: String,
    status: TaskStatus,
) {
    if let Some(last) = sent.get(&task_id) {
        if status.state < *last {
            debug!(%task_id, have = %last, got = %status.state, "regressing report dropped");
            return;
        }
    }
    match pending.get(&task_id) {
        Some(queued) if status.state < queued.state => {
            debug!(%task_id, "stale report superseded by queued one");
        }
        _ => {
            pending.insert(task_id, status);
        }
    }
}
