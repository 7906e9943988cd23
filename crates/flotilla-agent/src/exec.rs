//! The runtime boundary and the per-task state driver.
//!
//! The concrete container runtime (image pull, create, start, kill)
//! lives behind [`Controller`]; the driver here owns the order of
//! operations and the states reported at each step. Delivery is
//! at-least-once, so controllers may see the same assignment more than
//! once and every operation must tolerate already-done work.

use async_trait::async_trait;

use flotilla_store::{NodeDescription, Task, TaskState};

/// Runtime-layer failure.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ControlError {
    pub message: String,
    /// Errors after the task reached `Running` mark it `Failed`;
    /// earlier ones mark it `Rejected`.
    pub fatal: bool,
}

impl ControlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }
}

/// Drives one task through its runtime lifecycle.
#[async_trait]
pub trait Controller: Send {
    /// Apply an updated spec to a running task.
    async fn update(&mut self, task: &Task) -> Result<(), ControlError>;

    /// Make the task runnable: pull images, create sandboxes.
    async fn prepare(&mut self) -> Result<(), ControlError>;

    /// Start execution.
    async fn start(&mut self) -> Result<(), ControlError>;

    /// Block until the task exits. `Ok` is a clean exit.
    async fn wait(&mut self) -> Result<(), ControlError>;

    /// Ask the task to stop gracefully.
    async fn shutdown(&mut self) -> Result<(), ControlError>;

    /// Stop the task immediately.
    async fn terminate(&mut self) -> Result<(), ControlError>;

    /// Release everything the task held.
    async fn remove(&mut self) -> Result<(), ControlError>;
}

/// Factory for controllers plus the node's self-description.
#[async_trait]
pub trait Executor: Send + Sync {
    fn describe(&self) -> NodeDescription;

    async fn controller(&self, task: &Task) -> Result<Box<dyn Controller>, ControlError>;
}

/// Outcome of a controller run, already mapped to the terminal state to
/// report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Shutdown,
    Failed(String),
    Rejected(String),
}

impl RunOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            RunOutcome::Completed => TaskState::Completed,
            RunOutcome::Shutdown => TaskState::Shutdown,
            RunOutcome::Failed(_) => TaskState::Failed,
            RunOutcome::Rejected(_) => TaskState::Rejected,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RunOutcome::Failed(err) | RunOutcome::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

/// Run a controller through prepare → start → wait, reporting each state
/// through `report`, until the task exits or `cancel` fires. Spec
/// updates arriving on `updates` are applied between wait rounds once
/// the task is running.
///
/// Errors before `Running` produce `Rejected`; later ones `Failed`.
/// Cancellation runs a graceful shutdown and reports `Shutdown`.
pub async fn drive<R>(
    ctlr: &mut dyn Controller,
    mut cancel: tokio::sync::watch::Receiver<bool>,
    mut updates: tokio::sync::mpsc::Receiver<Task>,
    mut report: R,
) -> RunOutcome
where
    R: FnMut(TaskState) + Send,
{
    macro_rules! step {
        ($op:expr, $state:expr) => {
            tokio::select! {
                result = $op => {
                    if let Err(err) = result {
                        return RunOutcome::Rejected(err.message);
                    }
                    report($state);
                }
                _ = cancel.changed() => {
                    return shutdown(ctlr).await;
                }
            }
        };
    }

    report(TaskState::Preparing);
    step!(ctlr.prepare(), TaskState::Ready);
    report(TaskState::Starting);
    step!(ctlr.start(), TaskState::Running);

    loop {
        enum Wake {
            Exited(Result<(), ControlError>),
            Update(Task),
            Cancel,
        }

        let wake = tokio::select! {
            result = ctlr.wait() => Wake::Exited(result),
            Some(task) = updates.recv() => Wake::Update(task),
            _ = cancel.changed() => Wake::Cancel,
        };

        match wake {
            Wake::Exited(Ok(())) => return RunOutcome::Completed,
            Wake::Exited(Err(err)) => return RunOutcome::Failed(err.message),
            Wake::Update(task) => {
                if let Err(err) = ctlr.update(&task).await {
                    return RunOutcome::Failed(err.message);
                }
            }
            Wake::Cancel => return shutdown(ctlr).await,
        }
    }
}

async fn shutdown(ctlr: &mut dyn Controller) -> RunOutcome {
    if let Err(err) = ctlr.shutdown().await {
        if let Err(err) = ctlr.terminate().await {
            return RunOutcome::Failed(err.message);
        }
        return RunOutcome::Failed(err.message);
    }
    RunOutcome::Shutdown
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted controller for state-machine tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    pub struct Script {
        pub fail_prepare: bool,
        pub fail_start: bool,
        pub fail_wait: bool,
        /// `wait` blocks until cancelled when true.
        pub long_running: bool,
    }

    #[derive(Default)]
    pub struct Counters {
        pub prepares: AtomicUsize,
        pub starts: AtomicUsize,
        pub shutdowns: AtomicUsize,
        pub removes: AtomicUsize,
        pub updates: AtomicUsize,
    }

    pub struct FakeController {
        pub script: Script,
        pub counters: Arc<Counters>,
    }

    impl FakeController {
        pub fn new(script: Script) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    script,
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    #[async_trait]
    impl Controller for FakeController {
        async fn update(&mut self, _task: &Task) -> Result<(), ControlError> {
            self.counters.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn prepare(&mut self) -> Result<(), ControlError> {
            self.counters.prepares.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_prepare {
                return Err(ControlError::new("image pull failed"));
            }
            Ok(())
        }

        async fn start(&mut self) -> Result<(), ControlError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_start {
                return Err(ControlError::new("container start failed"));
            }
            Ok(())
        }

        async fn wait(&mut self) -> Result<(), ControlError> {
            if self.script.long_running {
                // Pretend to run forever; `drive` races this with cancel.
                std::future::pending::<()>().await;
            }
            if self.script.fail_wait {
                return Err(ControlError::new("exit status 1"));
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), ControlError> {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn terminate(&mut self) -> Result<(), ControlError> {
            Ok(())
        }

        async fn remove(&mut self) -> Result<(), ControlError> {
            self.counters.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tokio::sync::watch;

    async fn run(script: Script) -> (RunOutcome, Vec<TaskState>) {
        let (mut ctlr, _) = FakeController::new(script);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_update_tx, update_rx) = tokio::sync::mpsc::channel(1);
        let mut states = Vec::new();
        let outcome = drive(&mut ctlr, cancel_rx, update_rx, |s| states.push(s)).await;
        (outcome, states)
    }

    #[tokio::test]
    async fn clean_run_reports_full_ladder() {
        let (outcome, states) = run(Script::default()).await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            states,
            vec![
                TaskState::Preparing,
                TaskState::Ready,
                TaskState::Starting,
                TaskState::Running,
            ]
        );
    }

    #[tokio::test]
    async fn prepare_failure_is_rejected() {
        let (outcome, states) = run(Script {
            fail_prepare: true,
            ..Script::default()
        })
        .await;
        assert!(matches!(outcome, RunOutcome::Rejected(_)));
        assert_eq!(states, vec![TaskState::Preparing]);
    }

    #[tokio::test]
    async fn start_failure_is_rejected() {
        let (outcome, _) = run(Script {
            fail_start: true,
            ..Script::default()
        })
        .await;
        // The task never reached Running.
        assert!(matches!(outcome, RunOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn exit_failure_after_running_is_failed() {
        let (outcome, states) = run(Script {
            fail_wait: true,
            ..Script::default()
        })
        .await;
        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert!(states.contains(&TaskState::Running));
    }

    #[tokio::test]
    async fn cancel_during_run_shuts_down() {
        let (mut ctlr, counters) = FakeController::new(Script {
            long_running: true,
            ..Script::default()
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (_update_tx, update_rx) = tokio::sync::mpsc::channel(1);

        let driver = async {
            let mut states = Vec::new();
            let outcome = drive(&mut ctlr, cancel_rx, update_rx, |s| states.push(s)).await;
            (outcome, states)
        };
        let canceller = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_tx.send(true).unwrap();
        };

        let ((outcome, states), ()) = tokio::join!(driver, canceller);
        assert_eq!(outcome, RunOutcome::Shutdown);
        assert!(states.contains(&TaskState::Running));
        assert_eq!(counters.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
