//! The assembled Raft node.
//!
//! Owns the openraft instance, the durable log database, the node id
//! map, and the leadership watch. All store writes on a manager flow
//! through [`RaftNode::propose`]; the manager wires the node into the
//! store as its [`ProposalRouter`] while it holds leadership.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use openraft::error::{ClientWriteError, RaftError as OpenraftError};
use openraft::{BasicNode, ServerState, SnapshotPolicy};
use redb::{Database, TableDefinition};
use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_store::{ProposalError, ProposalRouter, Store, StoreAction};

use crate::error::{RaftError, RaftResult};
use crate::log_store::LogStore;
use crate::network::NetworkFactory;
use crate::node_map::NodeIdMap;
use crate::state_machine::StateMachine;
use crate::typ::{FlotillaRaft, Request};

/// Raft ids that were removed and must never rejoin.
const REMOVED: TableDefinition<u64, ()> = TableDefinition::new("removed_members");

/// Leadership as observed from openraft metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaderState {
    pub is_leader: bool,
    pub leader: Option<u64>,
}

/// A consensus member, for membership listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub raft_id: u64,
    pub node_id: String,
    pub addr: String,
    pub leader: bool,
}

#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// This node's store id (certificate CN).
    pub node_id: String,
    /// Advertised address for intra-cluster RPCs.
    pub addr: String,
    /// Manager state directory; the log lives under `<dir>/raft/`.
    pub state_dir: PathBuf,
    /// Upper bound on a serialized proposal.
    pub proposal_size_limit: usize,
    /// Applied entries between snapshots.
    pub snapshot_interval: u64,
    /// Entries kept past a snapshot for lagging followers.
    pub log_entries_for_slow_followers: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl RaftNodeConfig {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>, state_dir: PathBuf) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
            state_dir,
            proposal_size_limit: 1 << 20,
            snapshot_interval: 10_000,
            log_entries_for_slow_followers: 500,
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1_500,
            election_timeout_max_ms: 3_000,
        }
    }
}

pub struct RaftNode {
    raft: FlotillaRaft,
    store: Store,
    db: Arc<Database>,
    node_map: Arc<NodeIdMap>,
    raft_id: u64,
    config: RaftNodeConfig,
    leader_rx: watch::Receiver<LeaderState>,
    /// Set once this member observes its own removal.
    removed_rx: watch::Receiver<bool>,
}

impl RaftNode {
    /// Open storage, restore the latest snapshot into the store, and
    /// start the openraft instance. The node joins no cluster by itself;
    /// call [`RaftNode::bootstrap`] on the first manager or have an
    /// existing leader admit it via [`RaftNode::admit`].
    pub async fn new(config: RaftNodeConfig, store: Store) -> RaftResult<Arc<Self>> {
        let raft_dir = config.state_dir.join("raft");
        std::fs::create_dir_all(&raft_dir).map_err(|e| RaftError::Storage(e.to_string()))?;
        let db = Arc::new(
            Database::create(raft_dir.join("wal.redb"))
                .map_err(|e| RaftError::Storage(e.to_string()))?,
        );
        {
            let txn = db
                .begin_write()
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            txn.open_table(REMOVED)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            txn.commit().map_err(|e| RaftError::Storage(e.to_string()))?;
        }

        let node_map = Arc::new(NodeIdMap::new(Arc::clone(&db))?);
        let raft_id = node_map.assign(&config.node_id)?;

        let log_store = LogStore::new(Arc::clone(&db))
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        let state_machine =
            StateMachine::new(Arc::clone(&db), store.clone(), Arc::clone(&node_map))
                .map_err(|e| RaftError::Storage(e.to_string()))?;

        let raft_config = Arc::new(openraft::Config {
            cluster_name: "flotilla".to_string(),
            heartbeat_interval: config.heartbeat_interval_ms,
            election_timeout_min: config.election_timeout_min_ms,
            election_timeout_max: config.election_timeout_max_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_interval),
            max_in_snapshot_log_to_keep: config.log_entries_for_slow_followers,
            ..Default::default()
        });

        let raft = openraft::Raft::new(
            raft_id,
            raft_config,
            NetworkFactory::new(),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| RaftError::Storage(e.to_string()))?;

        let (leader_tx, leader_rx) = watch::channel(LeaderState::default());
        let (removed_tx, removed_rx) = watch::channel(false);
        Self::spawn_metrics_watch(raft.clone(), raft_id, leader_tx, removed_tx);

        info!(node_id = %config.node_id, raft_id, "raft node started");

        Ok(Arc::new(Self {
            raft,
            store,
            db,
            node_map,
            raft_id,
            config,
            leader_rx,
            removed_rx,
        }))
    }

    fn spawn_metrics_watch(
        raft: FlotillaRaft,
        raft_id: u64,
        leader_tx: watch::Sender<LeaderState>,
        removed_tx: watch::Sender<bool>,
    ) {
        let mut metrics = raft.metrics();
        tokio::spawn(async move {
            loop {
                let snapshot = metrics.borrow().clone();
                let state = LeaderState {
                    is_leader: snapshot.state == ServerState::Leader,
                    leader: snapshot.current_leader,
                };
                if *leader_tx.borrow() != state && leader_tx.send(state).is_err() {
                    return;
                }

                // A committed config that no longer contains this member
                // means it was removed from the cluster.
                let membership = snapshot.membership_config;
                let in_config = membership
                    .membership()
                    .nodes()
                    .any(|(id, _)| *id == raft_id);
                if !in_config && membership.log_id().is_some() {
                    warn!(raft_id, "this member was removed from the cluster");
                    let _ = removed_tx.send(true);
                    return;
                }

                if metrics.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Initialize a fresh single-member cluster. A node that is already
    /// initialized ignores this (restart path).
    pub async fn bootstrap(&self) -> RaftResult<()> {
        let mut members = BTreeMap::new();
        members.insert(self.raft_id, BasicNode::new(&self.config.addr));
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(raft_id = self.raft_id, "cluster bootstrapped");
                Ok(())
            }
            // Already initialized: expected on restart.
            Err(err) => {
                info!(error = %err, "bootstrap skipped");
                Ok(())
            }
        }
    }

    /// Propose a store-action batch and wait until it is applied locally.
    pub async fn propose(&self, actions: Vec<StoreAction>) -> RaftResult<()> {
        let request = Request { actions };
        let size = serde_json::to_vec(&request)
            .map_err(|e| RaftError::ProposalRejected(e.to_string()))?
            .len();
        if size > self.config.proposal_size_limit {
            return Err(RaftError::RequestTooLarge {
                size,
                limit: self.config.proposal_size_limit,
            });
        }

        let response = match self.raft.client_write(request).await {
            Ok(resp) => resp,
            Err(OpenraftError::APIError(ClientWriteError::ForwardToLeader(_))) => {
                return Err(RaftError::LostLeadership);
            }
            Err(OpenraftError::APIError(err)) => {
                return Err(RaftError::ProposalRejected(err.to_string()));
            }
            Err(OpenraftError::Fatal(_)) => return Err(RaftError::Stopped),
        };

        let data = response.data;
        if !data.applied {
            return Err(RaftError::ProposalRejected(
                data.error.unwrap_or_else(|| "batch rejected".to_string()),
            ));
        }
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.leader_rx.borrow().is_leader
    }

    /// Current leader's Raft id, if known.
    pub fn leader(&self) -> Option<u64> {
        self.leader_rx.borrow().leader
    }

    /// Current leader's advertised address, if known.
    pub fn leader_addr(&self) -> Option<String> {
        let leader = self.leader()?;
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone())
    }

    /// Watch channel publishing leadership transitions.
    pub fn leader_changes(&self) -> watch::Receiver<LeaderState> {
        self.leader_rx.clone()
    }

    /// Watch channel set to true when this member observes its own removal.
    pub fn member_removed(&self) -> watch::Receiver<bool> {
        self.removed_rx.clone()
    }

    /// Admit a new member: assign it a Raft id, replicate the snapshot to
    /// it as a learner, then promote it to voter. Leader-only.
    pub async fn admit(&self, node_id: &str, addr: &str) -> RaftResult<u64> {
        let raft_id = self.node_map.assign(node_id)?;

        if self.is_removed(raft_id)? {
            return Err(RaftError::IdRemoved(raft_id));
        }
        if self.voter_ids().contains(&raft_id) {
            return Err(RaftError::IdExists(raft_id));
        }

        self.raft
            .add_learner(raft_id, BasicNode::new(addr), true)
            .await
            .map_err(|e| RaftError::Membership(e.to_string()))?;

        let mut voters = self.voter_ids();
        voters.insert(raft_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| RaftError::Membership(e.to_string()))?;

        info!(node_id, raft_id, addr, "member admitted");
        Ok(raft_id)
    }

    /// Remove a member from the cluster. Refused when it would leave the
    /// cluster without quorum.
    pub async fn remove_member(&self, raft_id: u64) -> RaftResult<()> {
        let mut voters = self.voter_ids();
        if !voters.contains(&raft_id) {
            return Err(RaftError::IdNotFound(raft_id));
        }
        if voters.len() == 1 {
            return Err(RaftError::CannotRemoveMember(raft_id));
        }

        voters.remove(&raft_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| RaftError::Membership(e.to_string()))?;
        self.mark_removed(raft_id)?;

        info!(raft_id, "member removed");
        Ok(())
    }

    /// Current consensus members.
    pub fn members(&self) -> Vec<MemberInfo> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(raft_id, node)| MemberInfo {
                raft_id: *raft_id,
                node_id: self.node_map.node_id_for(*raft_id).unwrap_or_default(),
                addr: node.addr.clone(),
                leader: Some(*raft_id) == leader,
            })
            .collect()
    }

    pub fn raft_id(&self) -> u64 {
        self.raft_id
    }

    pub fn node_map(&self) -> &Arc<NodeIdMap> {
        &self.node_map
    }

    pub fn raft(&self) -> &FlotillaRaft {
        &self.raft
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.raft.shutdown().await {
            warn!(error = %err, "raft shutdown");
        }
    }

    fn voter_ids(&self) -> BTreeSet<u64> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    fn is_removed(&self, raft_id: u64) -> RaftResult<bool> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        let table = txn
            .open_table(REMOVED)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        Ok(table
            .get(raft_id)
            .map_err(|e| RaftError::Storage(e.to_string()))?
            .is_some())
    }

    fn mark_removed(&self, raft_id: u64) -> RaftResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(REMOVED)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            table
                .insert(raft_id, ())
                .map_err(|e| RaftError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| RaftError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// [`ProposalRouter`] adapter installed into the store on leadership.
pub struct RaftProposer(pub Arc<RaftNode>);

impl ProposalRouter for RaftProposer {
    fn propose(&self, actions: Vec<StoreAction>) -> BoxFuture<'static, Result<(), ProposalError>> {
        let node = Arc::clone(&self.0);
        async move {
            node.propose(actions).await.map_err(|err| match err {
                RaftError::LostLeadership => ProposalError::LostLeadership,
                RaftError::Stopped => ProposalError::Stopped,
                RaftError::RequestTooLarge { size, limit } => {
                    ProposalError::TooLarge { size, limit }
                }
                RaftError::ProposalRejected(msg) => ProposalError::Rejected(msg),
                other => ProposalError::Rejected(other.to_string()),
            })
        }
        .boxed()
    }
}
