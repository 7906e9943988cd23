//! Development executor.
//!
//! Stands in for a container runtime: tasks "run" as idle placeholders
//! that advance through the full state machine and stop on request.
//! Useful for exercising a cluster end to end without a runtime
//! attached; the real runtime plugs in through the same traits.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use flotilla_agent::{ControlError, Controller, Executor};
use flotilla_store::{NodeDescription, NodeResources, Platform, Task};

#[derive(Default)]
pub struct DevExecutor;

#[async_trait]
impl Executor for DevExecutor {
    fn describe(&self) -> NodeDescription {
        NodeDescription {
            hostname: hostname(),
            platform: Platform {
                architecture: std::env::consts::ARCH.to_string(),
                os: std::env::consts::OS.to_string(),
            },
            resources: NodeResources {
                nano_cpus: (std::thread::available_parallelism()
                    .map(|n| n.get() as u64)
                    .unwrap_or(1))
                    * 1_000_000_000,
                memory_bytes: 0,
            },
            engine: Default::default(),
        }
    }

    async fn controller(&self, task: &Task) -> Result<Box<dyn Controller>, ControlError> {
        info!(task_id = %task.id, image = %task.spec.container.image, "dev controller created");
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Box::new(DevController {
            task_id: task.id.clone(),
            stop_tx,
            stop_rx,
        }))
    }
}

struct DevController {
    task_id: String,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Controller for DevController {
    async fn update(&mut self, _task: &Task) -> Result<(), ControlError> {
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ControlError> {
        info!(task_id = %self.task_id, "dev task started");
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), ControlError> {
        let mut stopped = self.stop_rx.clone();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ControlError> {
        info!(task_id = %self.task_id, "dev task stopping");
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), ControlError> {
        let _ = self.stop_tx.send(true);
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), ControlError> {
        Ok(())
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
