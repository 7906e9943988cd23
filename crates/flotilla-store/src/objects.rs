//! Domain types for the Flotilla object store.
//!
//! Everything persisted by a manager lives here. All types serialize
//! to/from JSON: that is the Raft proposal payload, the snapshot payload,
//! and the wire envelope payload, so additions must stay
//! backward-deserializable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier of any stored object.
pub type ObjectId = String;

/// Identifier of a node (also the CN of the node's TLS certificate).
pub type NodeId = String;

/// Identifier of a service.
pub type ServiceId = String;

/// Identifier of a task.
pub type TaskId = String;

// ── Meta ──────────────────────────────────────────────────────────

/// Human-facing identity of an object: a unique name plus free-form labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Annotations {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Annotations {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
        }
    }
}

/// Bookkeeping carried by every stored object.
///
/// `version` advances once per committed mutation and implements optimistic
/// concurrency: an update that does not present the stored version fails
/// with `StaleVersion`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub annotations: Annotations,
}

// ── Cluster ───────────────────────────────────────────────────────

/// The singleton cluster object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ObjectId,
    pub meta: Meta,
    pub spec: ClusterSpec,
    /// Root CA material; the private key may be absent (external CA) or
    /// sealed with a passphrase.
    pub root_ca: RootCaMaterial,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub annotations: Annotations,
    pub ca: CaConfig,
    pub raft: RaftConfig,
    pub dispatcher: DispatcherConfig,
    /// Terminal tasks retained per slot before the reaper collects them.
    pub task_history_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaConfig {
    /// Lifetime of issued node certificates, in seconds.
    pub node_cert_lifetime_secs: u64,
    /// External signer endpoints, tried in order before the local root.
    #[serde(default)]
    pub external_cas: Vec<ExternalCaConfig>,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            // 90 days
            node_cert_lifetime_secs: 90 * 24 * 3600,
            external_cas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalCaConfig {
    pub url: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaftConfig {
    /// Number of applied entries between snapshots.
    pub snapshot_interval: u64,
    /// Entries kept past a snapshot so lagging followers can catch up.
    pub log_entries_for_slow_followers: u64,
    pub heartbeat_tick_ms: u64,
    pub election_tick_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 10_000,
            log_entries_for_slow_followers: 500,
            heartbeat_tick_ms: 1_000,
            election_tick_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Expected heartbeat period for agents, in seconds.
    pub heartbeat_period_secs: u64,
    /// Missed-heartbeat budget before a node is declared down, as a
    /// multiple of the period.
    pub heartbeat_grace_multiple: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_secs: 5,
            heartbeat_grace_multiple: 3,
        }
    }
}

/// Root CA certificate and (optionally sealed) key, plus the join secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RootCaMaterial {
    pub cert_pem: String,
    /// Private key PEM, or a sealed envelope when a CA passphrase is set.
    pub key: Option<CaKeyMaterial>,
    pub join_token_worker: String,
    pub join_token_manager: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protection", rename_all = "snake_case")]
pub enum CaKeyMaterial {
    Plain { key_pem: String },
    /// Sealed with a passphrase-derived key; see `flotilla-ca`.
    Sealed { envelope: String },
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub meta: Meta,
    pub role: NodeRole,
    pub spec: NodeSpec,
    /// Self-reported facts: hostname, platform, resources.
    #[serde(default)]
    pub description: Option<NodeDescription>,
    pub status: NodeStatus,
    pub certificate: NodeCertificate,
    /// Present only on manager nodes.
    #[serde(default)]
    pub manager: Option<ManagerStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub annotations: Annotations,
    pub availability: NodeAvailability,
    pub membership: NodeMembership,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAvailability {
    #[default]
    Active,
    Pause,
    Drain,
}

/// Admission state; advances monotonically to accepted or rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMembership {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeDescription {
    pub hostname: String,
    pub platform: Platform,
    pub resources: NodeResources,
    #[serde(default)]
    pub engine: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeResources {
    /// Nano-CPUs (1 core = 1e9).
    pub nano_cpus: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub state: NodeState,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    Ready,
    Down,
    Disconnected,
}

/// Certificate issuance state for a node, driven by the CA server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCertificate {
    pub status: CertificateStatus,
    #[serde(default)]
    pub csr_pem: String,
    #[serde(default)]
    pub cert_pem: String,
    /// Opaque token handed back by `issue_node_certificate`, polled via
    /// `node_certificate_status`.
    #[serde(default)]
    pub token: String,
    pub role: Option<NodeRole>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    #[default]
    Unknown,
    Pending,
    Renew,
    Issued,
    Rejected,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerStatus {
    pub raft_id: u64,
    pub addr: String,
    pub leader: bool,
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub meta: Meta,
    pub spec: ServiceSpec,
    /// Allocated runtime endpoint (VIPs, published ports).
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub annotations: Annotations,
    pub task: TaskSpec,
    pub mode: ServiceMode,
    #[serde(default)]
    pub update: Option<UpdateConfig>,
    #[serde(default)]
    pub endpoint: Option<EndpointSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServiceMode {
    /// Maintain exactly `replicas` non-terminal tasks in slots `1..=replicas`.
    Replicated { replicas: u64 },
    /// One task per eligible node.
    Global,
    /// Run each task to completion once; terminal tasks are not replaced.
    Batch,
}

impl Default for ServiceMode {
    fn default() -> Self {
        ServiceMode::Replicated { replicas: 1 }
    }
}

/// Rolling-update pacing for spec changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Maximum number of tasks updated simultaneously. Zero means all at once.
    pub parallelism: u64,
    /// Delay between update batches, in seconds.
    pub delay_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            delay_secs: 0,
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub meta: Meta,
    pub service_id: ServiceId,
    /// Replica identity within the service: `1..=n` for replicated
    /// services, 0 for global and batch tasks.
    pub slot: u64,
    /// Assigned node, empty until the scheduler places the task.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub spec: TaskSpec,
    /// Version of the service spec this task was stamped from.
    pub spec_version: u64,
    pub desired_state: TaskState,
    pub status: TaskStatus,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
}

impl Task {
    /// Observed-terminal check: the task has stopped executing and will
    /// never run again.
    pub fn is_terminal(&self) -> bool {
        self.status.state >= TaskState::Shutdown
    }
}

/// Task lifecycle states, in advancement order.
///
/// The derived ordering is load-bearing: a reported transition is legal
/// only if it does not decrease, and `>= Shutdown` means terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Allocated,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Shutdown,
    Completed,
    Failed,
    Rejected,
    /// Desired-state only: the agent should shut the task down so the
    /// reaper can delete it.
    Remove,
    /// The node hosting the task went away before reporting a terminal state.
    Orphaned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Allocated => "allocated",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Ready => "ready",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Shutdown => "shutdown",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Remove => "remove",
            TaskState::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub err: Option<String>,
    /// Unix seconds of the last state change.
    pub timestamp: u64,
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::New
    }
}

/// Template from which tasks are stamped; embedded in the service spec and
/// copied onto each task at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub container: ContainerSpec,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub networks: Vec<NetworkAttachmentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub target: String,
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
    /// For named volumes the allocator binds `source` to a volume id here.
    #[serde(default)]
    pub volume_id: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub reservations: NodeResources,
    #[serde(default)]
    pub limits: NodeResources,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    pub condition: RestartCondition,
    /// Delay before a replacement task starts, in milliseconds.
    pub delay_ms: u64,
    /// Maximum restarts within `window_secs`; zero means unbounded.
    pub max_attempts: u64,
    pub window_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            condition: RestartCondition::Any,
            delay_ms: 0,
            max_attempts: 0,
            window_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartCondition {
    None,
    OnFailure,
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placement {
    /// Constraint expressions: `node.labels.region==east`,
    /// `node.role!=manager`, `node.id==...`, `node.hostname!=...`.
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<Platform>,
}

// ── Networks, endpoints, volumes ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: ObjectId,
    pub meta: Meta,
    pub spec: NetworkSpec,
    /// Driver state resolved by the allocator.
    #[serde(default)]
    pub driver_state: Option<DriverState>,
    /// Pools carved for this network by the allocator.
    #[serde(default)]
    pub ipam: Option<IpamState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub annotations: Annotations,
    #[serde(default)]
    pub driver: Option<DriverConfig>,
    #[serde(default)]
    pub ipam: IpamOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverState {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamOptions {
    /// Requested subnet in CIDR form; the allocator picks one when empty.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamState {
    pub subnet: String,
    pub gateway: String,
}

/// A task's membership in a network, with its allocated addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: ObjectId,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachmentConfig {
    /// Network name or id; resolved to an id by the allocator.
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSpec {
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortConfig {
    pub name: String,
    pub protocol: PortProtocol,
    pub target_port: u16,
    /// Zero asks the allocator to pick from the dynamic range.
    #[serde(default)]
    pub published_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Allocated endpoint state mirrored onto services and tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    #[serde(default)]
    pub spec: EndpointSpec,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub virtual_ips: Vec<EndpointVip>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointVip {
    pub network_id: ObjectId,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: ObjectId,
    pub meta: Meta,
    pub spec: VolumeSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    pub annotations: Annotations,
    #[serde(default)]
    pub driver: Option<DriverConfig>,
}

// ── Extension resources ───────────────────────────────────────────

/// Registration of a custom resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extension {
    pub id: ObjectId,
    pub meta: Meta,
    #[serde(default)]
    pub description: String,
}

/// A custom object belonging to a registered [`Extension`] kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: ObjectId,
    pub meta: Meta,
    /// Must match the annotation name of a registered extension.
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_states_are_totally_ordered() {
        let states = [
            TaskState::New,
            TaskState::Allocated,
            TaskState::Assigned,
            TaskState::Accepted,
            TaskState::Preparing,
            TaskState::Ready,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Shutdown,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Rejected,
            TaskState::Remove,
            TaskState::Orphaned,
        ];
        for pair in states.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_starts_at_shutdown() {
        let mut task = Task {
            id: "t1".into(),
            meta: Meta::default(),
            service_id: "s1".into(),
            slot: 1,
            node_id: None,
            spec: TaskSpec::default(),
            spec_version: 0,
            desired_state: TaskState::Running,
            status: TaskStatus::default(),
            networks: Vec::new(),
            endpoint: None,
        };

        task.status.state = TaskState::Running;
        assert!(!task.is_terminal());
        task.status.state = TaskState::Shutdown;
        assert!(task.is_terminal());
        task.status.state = TaskState::Failed;
        assert!(task.is_terminal());
    }

    #[test]
    fn service_spec_roundtrips_through_json() {
        let spec = ServiceSpec {
            annotations: Annotations::named("web"),
            task: TaskSpec {
                container: ContainerSpec {
                    image: "nginx:1.27".into(),
                    env: vec!["PORT=80".into()],
                    ..ContainerSpec::default()
                },
                restart: RestartPolicy {
                    condition: RestartCondition::OnFailure,
                    delay_ms: 500,
                    max_attempts: 3,
                    window_secs: 60,
                },
                placement: Placement {
                    constraints: vec!["node.labels.tier==frontend".into()],
                    platforms: vec![],
                },
                ..TaskSpec::default()
            },
            mode: ServiceMode::Replicated { replicas: 3 },
            update: Some(UpdateConfig {
                parallelism: 2,
                delay_secs: 10,
            }),
            endpoint: None,
        };

        let json = serde_json::to_string(&spec).unwrap();
        let back: ServiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        // Byte-stable re-serialization.
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn membership_and_availability_defaults() {
        let spec = NodeSpec::default();
        assert_eq!(spec.availability, NodeAvailability::Active);
        assert_eq!(spec.membership, NodeMembership::Pending);
    }
}
