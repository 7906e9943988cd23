//! Raft network transport over tonic.
//!
//! One connection per peer, established lazily and re-established after
//! failure. openraft request/response structures ride as JSON inside the
//! opaque `RaftRequest`/`RaftResponse` envelope, so peers on adjacent
//! versions keep interoperating. Every send carries a bounded timeout;
//! a timed-out or failed send reports the peer unreachable and openraft
//! handles the retry/backoff schedule.

use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::transport::Channel;
use tracing::{debug, warn};

use flotilla_proto::raft::raft_service_client::RaftServiceClient;
use flotilla_proto::raft::RaftRequest;

use crate::typ::TypeConfig;

/// Default bound on a single peer RPC.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Creates per-peer connections for openraft.
pub struct NetworkFactory {
    send_timeout: Duration,
}

impl NetworkFactory {
    pub fn new() -> Self {
        Self {
            send_timeout: SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

impl Default for NetworkFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazily-connected link to one peer.
pub struct NetworkConnection {
    target: u64,
    addr: String,
    send_timeout: Duration,
    client: Option<RaftServiceClient<Channel>>,
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "raft peer connection created");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            send_timeout: self.send_timeout,
            client: None,
        }
    }
}

impl NetworkConnection {
    async fn client<E: std::error::Error>(
        &mut self,
    ) -> Result<&mut RaftServiceClient<Channel>, RPCError<u64, BasicNode, E>> {
        if self.client.is_none() {
            let endpoint = format!("http://{}", self.addr);
            let channel = Channel::from_shared(endpoint)
                .map_err(|e| self.unreachable(e))?
                .connect_timeout(self.send_timeout)
                .connect()
                .await
                .map_err(|e| self.unreachable(e))?;
            self.client = Some(RaftServiceClient::new(channel));
        }
        Ok(self.client.as_mut().expect("client just set"))
    }

    fn unreachable<E: std::error::Error>(
        &self,
        err: impl std::fmt::Display,
    ) -> RPCError<u64, BasicNode, E> {
        warn!(target = self.target, addr = %self.addr, error = %err, "raft peer unreachable");
        RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
            "peer {} at {}: {err}",
            self.target, self.addr
        ))))
    }

    /// Serialize, send with timeout, deserialize; drops the cached
    /// channel on failure so the next call reconnects.
    async fn roundtrip<Req, Resp, E>(
        &mut self,
        req: &Req,
        call: RaftCall,
    ) -> Result<Resp, RPCError<u64, BasicNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let data = serde_json::to_vec(req).map_err(|e| self.unreachable(e))?;
        let timeout = self.send_timeout;
        let client = self.client::<E>().await?;

        let mut request = tonic::Request::new(RaftRequest { data });
        request.set_timeout(timeout);

        let result = match call {
            RaftCall::AppendEntries => client.append_entries(request).await,
            RaftCall::Vote => client.vote(request).await,
            RaftCall::InstallSnapshot => client.install_snapshot(request).await,
        };

        let reply = match result {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                self.client = None;
                return Err(self.unreachable(status));
            }
        };

        if !reply.error.is_empty() {
            // Remote-side raft error (e.g. higher vote seen).
            match serde_json::from_str::<E>(&reply.error) {
                Ok(err) => return Err(RPCError::RemoteError(openraft::error::RemoteError::new(
                    self.target,
                    err,
                ))),
                Err(_) => return Err(self.unreachable(reply.error)),
            }
        }

        serde_json::from_slice(&reply.data).map_err(|e| self.unreachable(e))
    }
}

enum RaftCall {
    AppendEntries,
    Vote,
    InstallSnapshot,
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.roundtrip(&rpc, RaftCall::AppendEntries).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.roundtrip(&rpc, RaftCall::Vote).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.roundtrip(&rpc, RaftCall::InstallSnapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_creates_lazy_connection() {
        let mut factory = NetworkFactory::new();
        let node = BasicNode::new("127.0.0.1:2377");
        let conn = factory.new_client(3, &node).await;
        assert_eq!(conn.target, 3);
        assert_eq!(conn.addr, "127.0.0.1:2377");
        assert!(conn.client.is_none());
    }

    #[tokio::test]
    async fn unreachable_peer_reports_unreachable() {
        let mut factory = NetworkFactory::new().with_send_timeout(Duration::from_millis(50));
        // Reserved TEST-NET address: nothing listens here.
        let node = BasicNode::new("192.0.2.1:1");
        let mut conn = factory.new_client(1, &node).await;

        let result = conn
            .vote(
                VoteRequest {
                    vote: openraft::Vote::new(1, 1),
                    last_log_id: None,
                },
                RPCOption::new(Duration::from_millis(50)),
            )
            .await;

        assert!(matches!(result, Err(RPCError::Unreachable(_))));
    }
}
