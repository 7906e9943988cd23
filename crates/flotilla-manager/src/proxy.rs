//! Leader forwarding for control RPCs.
//!
//! Any manager can accept a control call; a non-leader transparently
//! forwards it to the current leader over the intra-cluster channel,
//! appending this manager to the `flotilla-redirect` metadata chain. A
//! call that arrives already carrying a chain is refused: one hop is
//! the maximum, anything more means the membership view is torn.

use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use flotilla_proto::control::control_client::ControlClient;
use flotilla_proto::control::control_server::Control;
use flotilla_proto::control::*;
use flotilla_proto::REDIRECT_HEADER;

use crate::controlapi::ControlApi;

/// Where a call should execute.
pub enum Route {
    /// This manager is the leader; handle locally.
    Local,
    /// Forward to the leader at this address.
    Forward(String),
}

/// Leadership oracle the proxy consults per call.
pub trait LeaderGuard: Send + Sync {
    fn is_leader(&self) -> bool;
    fn leader_addr(&self) -> Option<String>;
}

impl LeaderGuard for std::sync::Arc<flotilla_raft::RaftNode> {
    fn is_leader(&self) -> bool {
        flotilla_raft::RaftNode::is_leader(self)
    }

    fn leader_addr(&self) -> Option<String> {
        flotilla_raft::RaftNode::leader_addr(self)
    }
}

/// Control service wrapper: local on the leader, forwarding elsewhere.
pub struct ForwardingControl<G> {
    local: ControlApi,
    guard: G,
    /// This manager's advertised address, appended to the redirect chain.
    self_addr: String,
}

impl<G: LeaderGuard> ForwardingControl<G> {
    pub fn new(local: ControlApi, guard: G, self_addr: impl Into<String>) -> Self {
        Self {
            local,
            guard,
            self_addr: self_addr.into(),
        }
    }

    pub fn into_service(self) -> control_server::ControlServer<Self>
    where
        G: 'static,
    {
        control_server::ControlServer::new(self)
    }

    /// Decide the route, rejecting redirect loops.
    fn route<T>(&self, request: &Request<T>) -> Result<Route, Status> {
        let chain = request
            .metadata()
            .get(REDIRECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !chain.is_empty() && !self.guard.is_leader() {
            return Err(Status::resource_exhausted(format!(
                "redirect loop: call already forwarded via {chain}"
            )));
        }

        if self.guard.is_leader() {
            return Ok(Route::Local);
        }
        let leader = self
            .guard
            .leader_addr()
            .ok_or_else(|| Status::unavailable("no leader elected"))?;
        Ok(Route::Forward(leader))
    }

    async fn leader_client(&self, addr: &str) -> Result<ControlClient<Channel>, Status> {
        let channel = Channel::from_shared(format!("http://{addr}"))
            .map_err(|e| Status::unavailable(format!("leader address: {e}")))?
            .connect()
            .await
            .map_err(|e| Status::unavailable(format!("leader unreachable: {e}")))?;
        Ok(ControlClient::new(channel))
    }

    fn stamp<T>(&self, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        let value = MetadataValue::try_from(self.self_addr.as_str())
            .map_err(|_| Status::internal("invalid self address"))?;
        request.metadata_mut().insert(REDIRECT_HEADER, value);
        Ok(request)
    }
}

/// Route one RPC: run locally on the leader, forward otherwise.
macro_rules! route_rpc {
    ($self:ident, $request:ident, $method:ident) => {
        match $self.route(&$request)? {
            Route::Local => $self.local.$method($request).await,
            Route::Forward(addr) => {
                let mut client = $self.leader_client(&addr).await?;
                let forwarded = $self.stamp($request.into_inner())?;
                client.$method(forwarded).await
            }
        }
    };
}

#[tonic::async_trait]
impl<G: LeaderGuard + 'static> Control for ForwardingControl<G> {
    async fn get_cluster(
        &self,
        request: Request<GetClusterRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_cluster)
    }

    async fn update_cluster(
        &self,
        request: Request<UpdateClusterRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, update_cluster)
    }

    async fn list_nodes(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        route_rpc!(self, request, list_nodes)
    }

    async fn get_node(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_node)
    }

    async fn update_node(
        &self,
        request: Request<UpdateNodeRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, update_node)
    }

    async fn remove_node(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        route_rpc!(self, request, remove_node)
    }

    async fn create_service(
        &self,
        request: Request<CreateServiceRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, create_service)
    }

    async fn get_service(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_service)
    }

    async fn list_services(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        route_rpc!(self, request, list_services)
    }

    async fn update_service(
        &self,
        request: Request<UpdateServiceRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, update_service)
    }

    async fn remove_service(
        &self,
        request: Request<RemoveServiceRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        route_rpc!(self, request, remove_service)
    }

    async fn get_task(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_task)
    }

    async fn list_tasks(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        route_rpc!(self, request, list_tasks)
    }

    async fn remove_task(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        route_rpc!(self, request, remove_task)
    }

    async fn create_network(
        &self,
        request: Request<CreateNetworkRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, create_network)
    }

    async fn get_network(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_network)
    }

    async fn list_networks(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        route_rpc!(self, request, list_networks)
    }

    async fn remove_network(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        route_rpc!(self, request, remove_network)
    }

    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, create_volume)
    }

    async fn get_volume(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        route_rpc!(self, request, get_volume)
    }

    async fn list_volumes(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        route_rpc!(self, request, list_volumes)
    }

    async fn remove_volume(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        route_rpc!(self, request, remove_volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::Store;

    struct FixedGuard {
        leader: bool,
        addr: Option<String>,
    }

    impl LeaderGuard for FixedGuard {
        fn is_leader(&self) -> bool {
            self.leader
        }

        fn leader_addr(&self) -> Option<String> {
            self.addr.clone()
        }
    }

    fn forwarding(leader: bool, addr: Option<&str>) -> ForwardingControl<FixedGuard> {
        ForwardingControl::new(
            ControlApi::new(Store::new()),
            FixedGuard {
                leader,
                addr: addr.map(String::from),
            },
            "127.0.0.1:2377",
        )
    }

    #[tokio::test]
    async fn leader_handles_locally() {
        let control = forwarding(true, None);
        // No cluster bootstrapped: the LOCAL handler answers NotFound,
        // proving the call was not forwarded.
        let err = control
            .get_cluster(Request::new(GetClusterRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn follower_without_leader_is_unavailable() {
        let control = forwarding(false, None);
        let err = control
            .get_cluster(Request::new(GetClusterRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn redirect_chain_is_refused_on_non_leader() {
        let control = forwarding(false, Some("10.0.0.9:2377"));

        let mut request = Request::new(GetClusterRequest {});
        request.metadata_mut().insert(
            REDIRECT_HEADER,
            MetadataValue::try_from("10.0.0.7:2377").unwrap(),
        );

        let err = control.get_cluster(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn redirect_chain_is_accepted_on_leader() {
        let control = forwarding(true, None);

        let mut request = Request::new(GetClusterRequest {});
        request.metadata_mut().insert(
            REDIRECT_HEADER,
            MetadataValue::try_from("10.0.0.7:2377").unwrap(),
        );

        // Handled locally (NotFound from the empty store), not refused.
        let err = control.get_cluster(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
