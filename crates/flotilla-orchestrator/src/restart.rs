//! Restart policy bookkeeping.
//!
//! The orchestrator asks the supervisor two questions: *should* this
//! terminal task be replaced, and *when*. Attempts are tracked per
//! service slot inside the policy's sliding window; replacements wait
//! out the configured delay in a pending queue the orchestrator drains
//! on its tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use flotilla_store::{RestartCondition, RestartPolicy, Task, TaskState};

/// Key identifying a restart lineage: one service slot (or one node for
/// global services).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub service_id: String,
    pub slot: u64,
    pub node_id: Option<String>,
}

impl SlotKey {
    pub fn for_task(task: &Task) -> Self {
        // Global tasks have slot 0 and a pinned node; replicated tasks
        // have a slot and a movable node.
        if task.slot == 0 {
            Self {
                service_id: task.service_id.clone(),
                slot: 0,
                node_id: task.node_id.clone(),
            }
        } else {
            Self {
                service_id: task.service_id.clone(),
                slot: task.slot,
                node_id: None,
            }
        }
    }
}

/// A replacement waiting out its restart delay.
#[derive(Debug, Clone)]
pub struct PendingRestart {
    pub key: SlotKey,
    pub due: Instant,
}

/// Tracks restart attempts and delayed replacements.
#[derive(Debug, Default)]
pub struct RestartSupervisor {
    /// Restart timestamps per slot, pruned to the policy window.
    attempts: HashMap<SlotKey, Vec<Instant>>,
    pending: Vec<PendingRestart>,
}

impl RestartSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy decision for a terminal task.
    ///
    /// `Remove`-desired tasks never restart: the operator (or a
    /// reconciler) asked for them to go away.
    pub fn should_restart(&mut self, task: &Task, policy: &RestartPolicy) -> bool {
        if task.desired_state >= TaskState::Remove {
            return false;
        }
        let failed = matches!(
            task.status.state,
            TaskState::Failed | TaskState::Rejected | TaskState::Orphaned
        );
        let wanted = match policy.condition {
            RestartCondition::None => false,
            RestartCondition::OnFailure => failed,
            RestartCondition::Any => true,
        };
        if !wanted {
            return false;
        }

        if policy.max_attempts > 0 {
            let key = SlotKey::for_task(task);
            let window = Duration::from_secs(policy.window_secs);
            let now = Instant::now();
            let attempts = self.attempts.entry(key).or_default();
            if policy.window_secs > 0 {
                attempts.retain(|t| now.duration_since(*t) < window);
            }
            if attempts.len() as u64 >= policy.max_attempts {
                debug!(
                    service_id = %task.service_id,
                    slot = task.slot,
                    attempts = attempts.len(),
                    "restart budget exhausted"
                );
                return false;
            }
        }
        true
    }

    /// Record a restart decision and queue the replacement after the
    /// policy delay. Idempotent per slot: a slot already pending keeps
    /// its earlier due time.
    pub fn schedule(&mut self, task: &Task, policy: &RestartPolicy) {
        let key = SlotKey::for_task(task);
        self.attempts
            .entry(key.clone())
            .or_default()
            .push(Instant::now());

        if self.pending.iter().any(|p| p.key == key) {
            return;
        }
        let due = Instant::now() + Duration::from_millis(policy.delay_ms);
        debug!(service_id = %key.service_id, slot = key.slot, delay_ms = policy.delay_ms, "restart scheduled");
        self.pending.push(PendingRestart { key, due });
    }

    /// Take every pending restart whose delay has elapsed.
    pub fn due(&mut self) -> Vec<SlotKey> {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|p| p.due <= now);
        self.pending = waiting;
        ready.into_iter().map(|p| p.key).collect()
    }

    /// Earliest pending due time, for loop scheduling.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.due).min()
    }

    /// Drop state for a service (deleted services stop restarting).
    pub fn forget_service(&mut self, service_id: &str) {
        self.attempts.retain(|key, _| key.service_id != service_id);
        self.pending.retain(|p| p.key.service_id != service_id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{Meta, TaskSpec, TaskStatus};

    fn terminal_task(state: TaskState) -> Task {
        Task {
            id: "t1".into(),
            meta: Meta::default(),
            service_id: "s1".into(),
            slot: 1,
            node_id: Some("n1".into()),
            spec: TaskSpec::default(),
            spec_version: 1,
            desired_state: TaskState::Running,
            status: TaskStatus {
                state,
                ..TaskStatus::default()
            },
            networks: Vec::new(),
            endpoint: None,
        }
    }

    fn policy(condition: RestartCondition) -> RestartPolicy {
        RestartPolicy {
            condition,
            delay_ms: 0,
            max_attempts: 0,
            window_secs: 0,
        }
    }

    #[test]
    fn condition_none_never_restarts() {
        let mut sup = RestartSupervisor::new();
        let task = terminal_task(TaskState::Failed);
        assert!(!sup.should_restart(&task, &policy(RestartCondition::None)));
    }

    #[test]
    fn condition_on_failure_ignores_completed() {
        let mut sup = RestartSupervisor::new();
        let p = policy(RestartCondition::OnFailure);

        assert!(sup.should_restart(&terminal_task(TaskState::Failed), &p));
        assert!(sup.should_restart(&terminal_task(TaskState::Rejected), &p));
        assert!(sup.should_restart(&terminal_task(TaskState::Orphaned), &p));
        assert!(!sup.should_restart(&terminal_task(TaskState::Completed), &p));
        assert!(!sup.should_restart(&terminal_task(TaskState::Shutdown), &p));
    }

    #[test]
    fn condition_any_restarts_completed() {
        let mut sup = RestartSupervisor::new();
        let p = policy(RestartCondition::Any);
        assert!(sup.should_restart(&terminal_task(TaskState::Completed), &p));
    }

    #[test]
    fn remove_desired_tasks_never_restart() {
        let mut sup = RestartSupervisor::new();
        let mut task = terminal_task(TaskState::Failed);
        task.desired_state = TaskState::Remove;
        assert!(!sup.should_restart(&task, &policy(RestartCondition::Any)));
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut sup = RestartSupervisor::new();
        let p = RestartPolicy {
            condition: RestartCondition::Any,
            delay_ms: 0,
            max_attempts: 2,
            window_secs: 3600,
        };
        let task = terminal_task(TaskState::Failed);

        assert!(sup.should_restart(&task, &p));
        sup.schedule(&task, &p);
        sup.due();
        assert!(sup.should_restart(&task, &p));
        sup.schedule(&task, &p);
        sup.due();
        // Third attempt within the window is refused.
        assert!(!sup.should_restart(&task, &p));
    }

    #[test]
    fn due_respects_delay() {
        let mut sup = RestartSupervisor::new();
        let p = RestartPolicy {
            condition: RestartCondition::Any,
            delay_ms: 10_000,
            max_attempts: 0,
            window_secs: 0,
        };
        sup.schedule(&terminal_task(TaskState::Failed), &p);

        assert!(sup.due().is_empty());
        assert_eq!(sup.pending_len(), 1);
        assert!(sup.next_due().is_some());
    }

    #[test]
    fn zero_delay_is_immediately_due() {
        let mut sup = RestartSupervisor::new();
        let p = policy(RestartCondition::Any);
        sup.schedule(&terminal_task(TaskState::Failed), &p);

        let due = sup.due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].service_id, "s1");
        assert_eq!(due[0].slot, 1);
        assert_eq!(sup.pending_len(), 0);
    }

    #[test]
    fn schedule_is_idempotent_per_slot() {
        let mut sup = RestartSupervisor::new();
        let p = policy(RestartCondition::Any);
        let task = terminal_task(TaskState::Failed);
        sup.schedule(&task, &p);
        sup.schedule(&task, &p);
        assert_eq!(sup.pending_len(), 1);
    }

    #[test]
    fn forget_service_clears_state() {
        let mut sup = RestartSupervisor::new();
        let p = policy(RestartCondition::Any);
        sup.schedule(&terminal_task(TaskState::Failed), &p);
        sup.forget_service("s1");
        assert_eq!(sup.pending_len(), 0);
        assert!(sup.due().is_empty());
    }
}
