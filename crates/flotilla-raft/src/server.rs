//! gRPC services for consensus traffic and membership management.
//!
//! Consensus RPCs deserialize the JSON envelope, call into openraft, and
//! serialize the response back; raft-level errors travel in the envelope
//! `error` field (JSON) so the sender can reconstruct them, while
//! transport-level problems surface as gRPC status codes. The membership
//! service admits and removes managers; the propose RPC lets non-leader
//! managers forward writes to the leader.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use flotilla_proto::raft::raft_membership_server::RaftMembership;
use flotilla_proto::raft::raft_service_server::RaftService;
use flotilla_proto::raft::{
    JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, ListMembersRequest,
    ListMembersResponse, Member, ProposeRequest, ProposeResponse, RaftRequest, RaftResponse,
};
use flotilla_store::StoreAction;

use crate::error::RaftError;
use crate::node::RaftNode;
use crate::typ::TypeConfig;

/// Consensus RPC endpoint.
pub struct RaftRpcServer {
    node: Arc<RaftNode>,
}

impl RaftRpcServer {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn into_service(
        self,
    ) -> flotilla_proto::raft::raft_service_server::RaftServiceServer<Self> {
        flotilla_proto::raft::raft_service_server::RaftServiceServer::new(self)
    }
}

fn envelope<T: serde::Serialize, E: serde::Serialize>(
    result: Result<T, E>,
) -> Result<Response<RaftResponse>, Status> {
    match result {
        Ok(value) => {
            let data = serde_json::to_vec(&value)
                .map_err(|e| Status::internal(format!("serialize: {e}")))?;
            Ok(Response::new(RaftResponse {
                data,
                error: String::new(),
            }))
        }
        Err(err) => {
            let error = serde_json::to_string(&err)
                .map_err(|e| Status::internal(format!("serialize error: {e}")))?;
            Ok(Response::new(RaftResponse {
                data: Vec::new(),
                error,
            }))
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, Status> {
    serde_json::from_slice(data).map_err(|e| Status::invalid_argument(format!("deserialize: {e}")))
}

#[tonic::async_trait]
impl RaftService for RaftRpcServer {
    async fn append_entries(
        &self,
        request: Request<RaftRequest>,
    ) -> Result<Response<RaftResponse>, Status> {
        let req: openraft::raft::AppendEntriesRequest<TypeConfig> =
            decode(&request.into_inner().data)?;
        debug!(
            term = req.vote.leader_id().term,
            entries = req.entries.len(),
            "append_entries"
        );
        envelope(self.node.raft().append_entries(req).await)
    }

    async fn vote(
        &self,
        request: Request<RaftRequest>,
    ) -> Result<Response<RaftResponse>, Status> {
        let req: openraft::raft::VoteRequest<u64> = decode(&request.into_inner().data)?;
        debug!(term = req.vote.leader_id().term, "vote");
        envelope(self.node.raft().vote(req).await)
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftRequest>,
    ) -> Result<Response<RaftResponse>, Status> {
        let req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            decode(&request.into_inner().data)?;
        debug!(offset = req.offset, done = req.done, "install_snapshot");
        envelope(self.node.raft().install_snapshot(req).await)
    }

    async fn propose(
        &self,
        request: Request<ProposeRequest>,
    ) -> Result<Response<ProposeResponse>, Status> {
        let actions: Vec<StoreAction> = decode(&request.into_inner().actions)?;
        match self.node.propose(actions).await {
            Ok(()) => Ok(Response::new(ProposeResponse {
                applied: true,
                error: String::new(),
            })),
            Err(RaftError::LostLeadership) => {
                Err(Status::failed_precondition("not the leader"))
            }
            Err(RaftError::RequestTooLarge { size, limit }) => Err(
                Status::resource_exhausted(format!("proposal of {size} bytes exceeds {limit}")),
            ),
            Err(err) => Ok(Response::new(ProposeResponse {
                applied: false,
                error: err.to_string(),
            })),
        }
    }
}

/// Membership management endpoint, served by the leader.
pub struct RaftMembershipServer {
    node: Arc<RaftNode>,
}

impl RaftMembershipServer {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn into_service(
        self,
    ) -> flotilla_proto::raft::raft_membership_server::RaftMembershipServer<Self> {
        flotilla_proto::raft::raft_membership_server::RaftMembershipServer::new(self)
    }

    fn member_list(&self) -> Vec<Member> {
        self.node
            .members()
            .into_iter()
            .map(|m| Member {
                raft_id: m.raft_id,
                node_id: m.node_id,
                addr: m.addr,
                leader: m.leader,
            })
            .collect()
    }
}

fn membership_status(err: RaftError) -> Status {
    match err {
        RaftError::IdExists(id) => Status::already_exists(format!("member {id} already joined")),
        RaftError::IdRemoved(id) => {
            Status::permission_denied(format!("member {id} was removed and may not rejoin"))
        }
        RaftError::IdNotFound(id) => Status::not_found(format!("member {id} not found")),
        RaftError::CannotRemoveMember(id) => Status::failed_precondition(format!(
            "removing member {id} would leave the cluster without quorum"
        )),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl RaftMembership for RaftMembershipServer {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> Result<Response<JoinResponse>, Status> {
        if !self.node.is_leader() {
            return Err(Status::failed_precondition("not the leader"));
        }
        let req = request.into_inner();
        let raft_id = self
            .node
            .admit(&req.node_id, &req.addr)
            .await
            .map_err(membership_status)?;

        Ok(Response::new(JoinResponse {
            raft_id,
            members: self.member_list(),
        }))
    }

    async fn leave(
        &self,
        request: Request<LeaveRequest>,
    ) -> Result<Response<LeaveResponse>, Status> {
        if !self.node.is_leader() {
            return Err(Status::failed_precondition("not the leader"));
        }
        let req = request.into_inner();
        self.node
            .remove_member(req.raft_id)
            .await
            .map_err(membership_status)?;
        Ok(Response::new(LeaveResponse { ok: true }))
    }

    async fn list_members(
        &self,
        _request: Request<ListMembersRequest>,
    ) -> Result<Response<ListMembersResponse>, Status> {
        Ok(Response::new(ListMembersResponse {
            members: self.member_list(),
        }))
    }
}
