//! The agent process: session lifecycle and reconnection policy.
//!
//! One session at a time. On session failure the agent backs off
//! exponentially (with jitter), re-picks a manager by weight, and
//! re-registers. Controllers are NOT torn down across reconnects: the
//! new session's full assignment set reconciles against the running
//! controller map, and redelivered assignments are idempotent.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use flotilla_proto::dispatcher::dispatcher_client::DispatcherClient;
use flotilla_proto::dispatcher::{
    HeartbeatRequest, SessionMessage, SessionRequest, TaskStatusUpdate, UpdateTaskStatusRequest,
};
use flotilla_store::{Task, TaskStatus};

use crate::error::{AgentError, AgentResult};
use crate::exec::Executor;
use crate::managers::ManagerSet;
use crate::reporter::{StatusReporter, StatusSink};
use crate::worker::Worker;

const INITIAL_SESSION_BACKOFF: Duration = Duration::from_secs(1);
const MAX_SESSION_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This node's id (certificate CN).
    pub node_id: String,
    /// Bootstrap manager addresses; the set grows from session messages.
    pub managers: Vec<String>,
    /// Heartbeat period used until the dispatcher says otherwise.
    pub heartbeat_period: Duration,
    /// Status-report queue depth.
    pub report_queue: usize,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, managers: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            managers,
            heartbeat_period: Duration::from_secs(5),
            report_queue: 256,
        }
    }
}

/// Status sink whose target session can be swapped on reconnect, so the
/// reporter (and its pending reports) survive session churn.
struct SwappableSink {
    inner: RwLock<Option<SessionSink>>,
}

#[derive(Clone)]
struct SessionSink {
    client: DispatcherClient<Channel>,
    node_id: String,
    session_id: String,
}

#[async_trait::async_trait]
impl StatusSink for SwappableSink {
    async fn send(
        &self,
        updates: Vec<(String, TaskStatus)>,
    ) -> Result<Vec<String>, tonic::Status> {
        let Some(sink) = self.inner.read().unwrap().clone() else {
            return Err(tonic::Status::unavailable("no active session"));
        };

        let mut wire_updates = Vec::with_capacity(updates.len());
        for (task_id, status) in updates {
            let status = serde_json::to_vec(&status)
                .map_err(|e| tonic::Status::internal(format!("encode status: {e}")))?;
            wire_updates.push(TaskStatusUpdate { task_id, status });
        }

        let mut client = sink.client;
        let response = client
            .update_task_status(UpdateTaskStatusRequest {
                node_id: sink.node_id,
                session_id: sink.session_id,
                updates: wire_updates,
            })
            .await?;
        Ok(response.into_inner().acked)
    }
}

pub struct Agent {
    config: AgentConfig,
    executor: Arc<dyn Executor>,
    managers: Arc<ManagerSet>,
}

impl Agent {
    pub fn new(config: AgentConfig, executor: Arc<dyn Executor>) -> Self {
        let managers = Arc::new(ManagerSet::new(config.managers.clone()));
        Self {
            config,
            executor,
            managers,
        }
    }

    pub fn managers(&self) -> &Arc<ManagerSet> {
        &self.managers
    }

    /// Run until shutdown, reconnecting with backoff on session failure.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let sink = Arc::new(SwappableSink {
            inner: RwLock::new(None),
        });
        let reporter = StatusReporter::start(
            Arc::clone(&sink) as Arc<dyn StatusSink>,
            self.config.report_queue,
            shutdown.clone(),
        );
        let mut worker = Worker::new(Arc::clone(&self.executor), reporter);

        let mut backoff = Duration::ZERO;
        loop {
            if *shutdown.borrow() {
                worker.shutdown().await;
                return Ok(());
            }

            match self
                .run_session(&sink, &mut worker, &mut shutdown)
                .await
            {
                Ok(()) => {
                    worker.shutdown().await;
                    return Ok(());
                }
                Err(err) => {
                    backoff = (INITIAL_SESSION_BACKOFF + backoff * 2).min(MAX_SESSION_BACKOFF);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!(error = %err, retry_in = ?delay, "session failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One session: register, pump assignments, heartbeat. `Ok(())`
    /// only on deliberate shutdown.
    async fn run_session(
        &self,
        sink: &Arc<SwappableSink>,
        worker: &mut Worker,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<()> {
        let addr = self.managers.pick()?;
        debug!(%addr, "connecting to manager");

        let endpoint = Channel::from_shared(format!("http://{addr}"))
            .map_err(|e| AgentError::InvalidAddr(e.to_string()))?;
        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                self.managers.observe_failure(&addr);
                return Err(err.into());
            }
        };
        let mut client = DispatcherClient::new(channel);

        let description = serde_json::to_vec(&self.executor.describe())?;
        let mut stream = match client
            .session(SessionRequest {
                node_id: self.config.node_id.clone(),
                session_id: String::new(),
                description,
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) => {
                self.managers.observe_failure(&addr);
                return Err(status.into());
            }
        };

        let first = stream
            .message()
            .await?
            .ok_or(AgentError::SessionClosed)?;
        let session_id = first.session_id.clone();
        info!(%addr, %session_id, "session established");

        *sink.inner.write().unwrap() = Some(SessionSink {
            client: client.clone(),
            node_id: self.config.node_id.clone(),
            session_id: session_id.clone(),
        });

        self.apply_message(worker, first).await?;

        // Heartbeat pump; reports failure so the session loop can tear
        // down and re-pick a manager.
        let (hb_err_tx, mut hb_err_rx) = mpsc::channel::<AgentError>(1);
        let hb_client = client.clone();
        let hb_node = self.config.node_id.clone();
        let hb_session = session_id.clone();
        let hb_period = self.config.heartbeat_period;
        let hb_shutdown = shutdown.clone();
        let heartbeat = tokio::spawn(async move {
            heartbeat_loop(hb_client, hb_node, hb_session, hb_period, hb_shutdown, hb_err_tx)
                .await;
        });

        let result = loop {
            tokio::select! {
                message = stream.message() => match message {
                    Ok(Some(message)) => {
                        if let Err(err) = self.apply_message(worker, message).await {
                            break Err(err);
                        }
                    }
                    Ok(None) => break Err(AgentError::SessionClosed),
                    Err(status) => break Err(status.into()),
                },
                Some(err) = hb_err_rx.recv() => break Err(err),
                _ = shutdown.changed() => break Ok(()),
            }
        };

        heartbeat.abort();
        *sink.inner.write().unwrap() = None;
        result
    }

    async fn apply_message(
        &self,
        worker: &mut Worker,
        message: SessionMessage,
    ) -> AgentResult<()> {
        for manager in &message.managers {
            if manager.addr.is_empty() {
                warn!("skipping manager with empty address");
                continue;
            }
            self.managers.observe(&manager.addr, manager.weight);
        }

        if let Some(set) = message.assignments {
            let mut updated = Vec::with_capacity(set.updated.len());
            for assignment in set.updated {
                let task: Task = serde_json::from_slice(&assignment.task)?;
                updated.push(task);
            }
            if set.full {
                worker.assign_full(updated).await;
            } else {
                worker.assign_delta(updated, set.removed).await;
            }
        }

        if message.disconnect {
            return Err(AgentError::SessionClosed);
        }
        Ok(())
    }
}

async fn heartbeat_loop(
    mut client: DispatcherClient<Channel>,
    node_id: String,
    session_id: String,
    initial_period: Duration,
    mut shutdown: watch::Receiver<bool>,
    err_tx: mpsc::Sender<AgentError>,
) {
    let mut period = initial_period;
    loop {
        // Jitter keeps a fleet of agents from beating in lockstep.
        let jitter = rand::thread_rng().gen_range(0..=period.as_millis() as u64 / 4);
        tokio::select! {
            _ = tokio::time::sleep(period + Duration::from_millis(jitter)) => {}
            _ = shutdown.changed() => return,
        }

        match client
            .heartbeat(HeartbeatRequest {
                node_id: node_id.clone(),
                session_id: session_id.clone(),
            })
            .await
        {
            Ok(response) => {
                let secs = response.into_inner().period_secs;
                if secs > 0 {
                    period = Duration::from_secs(secs);
                }
            }
            Err(status) => {
                debug!(error = %status, "heartbeat failed");
                let _ = err_tx.send(status.into()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = AgentConfig::new("node-1", vec!["10.0.0.1:2377".into()]);
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.heartbeat_period, Duration::from_secs(5));
        assert!(config.report_queue > 0);
    }

    #[tokio::test]
    async fn swappable_sink_without_session_is_unavailable() {
        let sink = SwappableSink {
            inner: RwLock::new(None),
        };
        let err = sink.send(Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
