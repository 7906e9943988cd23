//! Manager assembly.
//!
//! One manager process = the store, the Raft node, the always-on RPC
//! surfaces (control, dispatcher, CA, raft), and a leadership loop that
//! starts the leader-only control loops on election and stops them on
//! demotion. Everything leader-only reads its inputs from the
//! replicated store, so a freshly elected leader resumes exactly where
//! the old one stopped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flotilla_allocator::Allocator;
use flotilla_ca::{CaServer, CaServerConfig, JoinToken, NodeCaGrpcServer, RootCa};
use flotilla_dispatcher::{Dispatcher, DispatcherConfig, DispatcherGrpcServer, WeightedPeer};
use flotilla_orchestrator::{Orchestrator, TaskReaper};
use flotilla_proto::raft::raft_membership_client::RaftMembershipClient;
use flotilla_proto::raft::JoinRequest;
use flotilla_raft::node::RaftProposer;
use flotilla_raft::{RaftMembershipServer, RaftNode, RaftNodeConfig, RaftRpcServer};
use flotilla_scheduler::Scheduler;
use flotilla_store::{
    new_id, Annotations, CaKeyMaterial, Cluster, ClusterSpec, Meta, RootCaMaterial, Store,
};

use crate::controlapi::ControlApi;
use crate::proxy::ForwardingControl;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("raft error: {0}")]
    Raft(#[from] flotilla_raft::RaftError),

    #[error("ca error: {0}")]
    Ca(#[from] flotilla_ca::CaError),

    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("join failed: {0}")]
    Join(String),

    #[error("invalid listen address: {0}")]
    ListenAddr(String),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// This manager's node id; generated when empty.
    pub node_id: String,
    /// Address the gRPC listener binds.
    pub listen_addr: String,
    /// Address other nodes use to reach this manager.
    pub advertise_addr: String,
    pub state_dir: PathBuf,
    /// An existing manager to join; `None` bootstraps a new cluster.
    pub join_addr: Option<String>,
    pub cluster_name: String,
}

impl ManagerConfig {
    pub fn new(listen_addr: impl Into<String>, state_dir: PathBuf) -> Self {
        let listen_addr = listen_addr.into();
        Self {
            node_id: new_id(),
            advertise_addr: listen_addr.clone(),
            listen_addr,
            state_dir,
            join_addr: None,
            cluster_name: "default".to_string(),
        }
    }
}

/// Create the singleton cluster object: fresh root CA, join tokens, and
/// default tuning. A set passphrase seals the root key at rest.
pub async fn bootstrap_cluster(
    store: &Store,
    cluster_name: &str,
    passphrase: Option<&str>,
) -> Result<Cluster, ManagerError> {
    if let Some(existing) = store.view(|tx| tx.cluster()) {
        return Ok(existing);
    }

    let root = RootCa::generate(cluster_name)?;
    let key_pem = root
        .key_pem()
        .expect("generated root always carries its key");
    let key = match passphrase {
        Some(phrase) => CaKeyMaterial::Sealed {
            envelope: flotilla_ca::seal(key_pem, phrase)?,
        },
        None => CaKeyMaterial::Plain {
            key_pem: key_pem.to_string(),
        },
    };

    let cluster = Cluster {
        id: new_id(),
        meta: Meta {
            annotations: Annotations::named(cluster_name),
            ..Meta::default()
        },
        spec: ClusterSpec {
            annotations: Annotations::named(cluster_name),
            task_history_limit: 5,
            ..ClusterSpec::default()
        },
        root_ca: RootCaMaterial {
            cert_pem: root.cert_pem().to_string(),
            key: Some(key),
            join_token_worker: JoinToken::generate(root.cert_pem()).to_string(),
            join_token_manager: JoinToken::generate(root.cert_pem()).to_string(),
        },
    };

    store.update(|tx| tx.create(cluster.clone())).await?;
    info!(cluster = cluster_name, "cluster bootstrapped");
    Ok(cluster)
}

/// Reconstruct the root CA from the replicated cluster object,
/// unsealing the key when a passphrase is available.
pub fn load_root_ca(
    cluster: &Cluster,
    passphrase: Option<&str>,
    previous: Option<&str>,
) -> Result<RootCa, ManagerError> {
    let key_pem = match &cluster.root_ca.key {
        Some(CaKeyMaterial::Plain { key_pem }) => Some(key_pem.clone()),
        Some(CaKeyMaterial::Sealed { envelope }) => match passphrase {
            Some(phrase) => Some(flotilla_ca::unseal_with_grace(envelope, phrase, previous)?),
            None => None,
        },
        None => None,
    };
    let lifetime = cluster.spec.ca.node_cert_lifetime_secs;
    Ok(RootCa::from_pem(cluster.root_ca.cert_pem.clone(), key_pem)
        .with_cert_lifetime_secs(lifetime))
}

pub struct Manager {
    config: ManagerConfig,
    store: Store,
    raft: Arc<RaftNode>,
    dispatcher: Dispatcher,
}

impl Manager {
    pub async fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        let store = Store::new();
        let raft = RaftNode::new(
            RaftNodeConfig::new(
                config.node_id.clone(),
                config.advertise_addr.clone(),
                config.state_dir.clone(),
            ),
            store.clone(),
        )
        .await?;
        let dispatcher = Dispatcher::new(store.clone());

        Ok(Self {
            config,
            store,
            raft,
            dispatcher,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Run the manager until shutdown or removal from the cluster.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ManagerError> {
        // Join an existing cluster or bootstrap a fresh one.
        match &self.config.join_addr {
            Some(addr) => self.join_cluster(addr).await?,
            None => self.raft.bootstrap().await?,
        }

        // Wait for the cluster object: created by us once elected, or
        // replicated from the existing leader.
        let cluster = self.await_cluster(&mut shutdown).await?;

        // Heartbeat tuning is cluster policy, not a per-manager flag.
        let dispatcher = self.dispatcher.clone().with_config(DispatcherConfig {
            heartbeat_period: Duration::from_secs(cluster.spec.dispatcher.heartbeat_period_secs),
            grace_multiple: cluster.spec.dispatcher.heartbeat_grace_multiple as u32,
            ..DispatcherConfig::default()
        });

        let (passphrase, previous) = flotilla_ca::passphrases_from_env();
        let root = Arc::new(load_root_ca(
            &cluster,
            passphrase.as_deref(),
            previous.as_deref(),
        )?);
        let ca_server = Arc::new(CaServer::new(
            self.store.clone(),
            Arc::clone(&root),
            CaServerConfig {
                cluster_id: cluster.id.clone(),
            },
        ));

        // Leadership lifecycle.
        let leadership = tokio::spawn(leadership_loop(
            self.store.clone(),
            Arc::clone(&self.raft),
            dispatcher.clone(),
            Arc::clone(&ca_server),
            shutdown.clone(),
        ));

        // The shared listener: control, dispatcher, ca, raft, membership.
        let listen: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|_| ManagerError::ListenAddr(self.config.listen_addr.clone()))?;
        let control = ForwardingControl::new(
            ControlApi::new(self.store.clone()),
            Arc::clone(&self.raft),
            self.config.advertise_addr.clone(),
        );
        let server = tonic::transport::Server::builder()
            .add_service(control.into_service())
            .add_service(DispatcherGrpcServer::new(dispatcher.clone()).into_service())
            .add_service(NodeCaGrpcServer::new(Arc::clone(&ca_server)).into_service())
            .add_service(RaftRpcServer::new(Arc::clone(&self.raft)).into_service())
            .add_service(RaftMembershipServer::new(Arc::clone(&self.raft)).into_service());

        info!(addr = %listen, node_id = %self.config.node_id, "manager listening");

        let mut removed = self.raft.member_removed();
        let serve_shutdown = async move {
            tokio::select! {
                _ = shutdown.changed() => info!("manager shutting down"),
                _ = removed.changed() => warn!("removed from cluster; shutting down"),
            }
        };
        server
            .serve_with_shutdown(listen, serve_shutdown)
            .await?;

        leadership.abort();
        self.raft.shutdown().await;
        Ok(())
    }

    async fn join_cluster(&self, addr: &str) -> Result<(), ManagerError> {
        let mut client = RaftMembershipClient::connect(format!("http://{addr}"))
            .await
            .map_err(|e| ManagerError::Join(e.to_string()))?;
        let response = client
            .join(JoinRequest {
                node_id: self.config.node_id.clone(),
                addr: self.config.advertise_addr.clone(),
            })
            .await
            .map_err(|e| ManagerError::Join(e.to_string()))?;
        info!(
            raft_id = response.into_inner().raft_id,
            via = addr,
            "joined cluster"
        );
        Ok(())
    }

    async fn await_cluster(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Cluster, ManagerError> {
        let mut leader_rx = self.raft.leader_changes();
        loop {
            if let Some(cluster) = self.store.view(|tx| tx.cluster()) {
                return Ok(cluster);
            }
            if leader_rx.borrow().is_leader {
                self.store
                    .set_router(Arc::new(RaftProposer(Arc::clone(&self.raft))));
                let (passphrase, _) = flotilla_ca::passphrases_from_env();
                return bootstrap_cluster(
                    &self.store,
                    &self.config.cluster_name,
                    passphrase.as_deref(),
                )
                .await;
            }
            tokio::select! {
                _ = leader_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = shutdown.changed() => {
                    return Err(ManagerError::Join("shutdown before cluster ready".into()));
                }
            }
        }
    }
}

/// Start the leader-only loops on election; stop them on demotion.
async fn leadership_loop(
    store: Store,
    raft: Arc<RaftNode>,
    dispatcher: Dispatcher,
    ca_server: Arc<CaServer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut leader_rx = raft.leader_changes();
    let mut running: Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)> = None;

    loop {
        let is_leader = leader_rx.borrow().is_leader;

        if is_leader && running.is_none() {
            info!("assumed leadership; starting control loops");
            store.set_router(Arc::new(RaftProposer(Arc::clone(&raft))));
            dispatcher.set_managers(manager_peers(&raft));

            let (stop_tx, stop_rx) = watch::channel(false);
            let handles = vec![
                spawn_loop("orchestrator", {
                    let store = store.clone();
                    let stop = stop_rx.clone();
                    async move { Orchestrator::new(store).run(stop).await.map_err(|e| e.to_string()) }
                }),
                spawn_loop("scheduler", {
                    let store = store.clone();
                    let stop = stop_rx.clone();
                    async move { Scheduler::new(store).run(stop).await.map_err(|e| e.to_string()) }
                }),
                spawn_loop("allocator", {
                    let store = store.clone();
                    let stop = stop_rx.clone();
                    async move { Allocator::new(store).run(stop).await.map_err(|e| e.to_string()) }
                }),
                spawn_loop("task-reaper", {
                    let store = store.clone();
                    let stop = stop_rx.clone();
                    async move { TaskReaper::new(store).run(stop).await.map_err(|e| e.to_string()) }
                }),
                spawn_loop("ca-server", {
                    let ca = Arc::clone(&ca_server);
                    let stop = stop_rx.clone();
                    async move { ca.run(stop).await.map_err(|e| e.to_string()) }
                }),
                spawn_loop("dispatcher-expiry", {
                    let dispatcher = dispatcher.clone();
                    let stop = stop_rx.clone();
                    async move {
                        dispatcher.run_expiry(stop).await;
                        Ok(())
                    }
                }),
            ];
            running = Some((stop_tx, handles));
        } else if !is_leader {
            if let Some((stop_tx, handles)) = running.take() {
                warn!("lost leadership; stopping control loops");
                store.clear_router();
                let _ = stop_tx.send(true);
                for handle in handles {
                    handle.abort();
                }
            }
        }

        if is_leader {
            // Keep agents' manager lists fresh.
            dispatcher.set_managers(manager_peers(&raft));
        }

        tokio::select! {
            result = leader_rx.changed() => {
                if result.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            _ = shutdown.changed() => {
                if let Some((stop_tx, _)) = &running {
                    let _ = stop_tx.send(true);
                }
                return;
            }
        }
    }
}

fn manager_peers(raft: &RaftNode) -> Vec<WeightedPeer> {
    raft.members()
        .into_iter()
        .map(|m| WeightedPeer {
            addr: m.addr,
            // The leader carries more dispatcher sessions elsewhere;
            // bias agents toward followers.
            weight: if m.leader { 4 } else { 8 },
        })
        .collect()
}

fn spawn_loop<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            error!(component = name, error = %err, "control loop exited with error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_creates_singleton_cluster() {
        let store = Store::new();
        let cluster = bootstrap_cluster(&store, "prod", None).await.unwrap();

        assert_eq!(cluster.meta.annotations.name, "prod");
        assert!(cluster.root_ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cluster.root_ca.join_token_worker.starts_with("FLTL-1-"));
        assert!(cluster.root_ca.join_token_manager.starts_with("FLTL-1-"));
        assert_ne!(
            cluster.root_ca.join_token_worker,
            cluster.root_ca.join_token_manager
        );

        // Idempotent: a second call returns the existing object.
        let again = bootstrap_cluster(&store, "prod", None).await.unwrap();
        assert_eq!(again.id, cluster.id);
        assert_eq!(store.view(|tx| tx.count::<Cluster>()), 1);
    }

    #[tokio::test]
    async fn passphrase_seals_root_key() {
        let store = Store::new();
        let cluster = bootstrap_cluster(&store, "prod", Some("hunter2"))
            .await
            .unwrap();

        match &cluster.root_ca.key {
            Some(CaKeyMaterial::Sealed { envelope }) => {
                assert!(envelope.starts_with("v1:"));
            }
            other => panic!("expected sealed key, got {other:?}"),
        }

        // Loading with the passphrase yields a signing root; without
        // it, a verify-only root.
        let signing = load_root_ca(&cluster, Some("hunter2"), None).unwrap();
        assert!(signing.can_sign());
        let verify_only = load_root_ca(&cluster, None, None).unwrap();
        assert!(!verify_only.can_sign());
    }

    #[tokio::test]
    async fn grace_passphrase_opens_sealed_key() {
        let store = Store::new();
        let cluster = bootstrap_cluster(&store, "prod", Some("old-pass"))
            .await
            .unwrap();

        let root = load_root_ca(&cluster, Some("new-pass"), Some("old-pass")).unwrap();
        assert!(root.can_sign());

        let err = load_root_ca(&cluster, Some("new-pass"), None).unwrap_err();
        assert!(matches!(err, ManagerError::Ca(_)));
    }

    #[test]
    fn config_defaults() {
        let config = ManagerConfig::new("127.0.0.1:2377", PathBuf::from("/tmp/flotilla"));
        assert!(!config.node_id.is_empty());
        assert_eq!(config.advertise_addr, "127.0.0.1:2377");
        assert!(config.join_addr.is_none());
        assert_eq!(config.cluster_name, "default");
    }
}
