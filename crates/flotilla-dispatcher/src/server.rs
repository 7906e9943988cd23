//! gRPC shim over the dispatcher core.

use std::pin::Pin;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::debug;

use flotilla_proto::dispatcher::dispatcher_server::{Dispatcher as DispatcherService, DispatcherServer};
use flotilla_proto::dispatcher::{
    HeartbeatRequest, HeartbeatResponse, SessionMessage, SessionRequest,
    UpdateTaskStatusRequest, UpdateTaskStatusResponse,
};
use flotilla_store::{NodeDescription, TaskStatus};

use crate::dispatcher::Dispatcher;

type SessionStream = Pin<Box<dyn Stream<Item = Result<SessionMessage, Status>> + Send>>;

pub struct DispatcherGrpcServer {
    dispatcher: Dispatcher,
}

impl DispatcherGrpcServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn into_service(self) -> DispatcherServer<Self> {
        DispatcherServer::new(self)
    }
}

#[tonic::async_trait]
impl DispatcherService for DispatcherGrpcServer {
    type SessionStream = SessionStream;

    async fn session(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let req = request.into_inner();
        let description: Option<NodeDescription> = if req.description.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(&req.description)
                    .map_err(|e| Status::invalid_argument(format!("description: {e}")))?,
            )
        };

        debug!(node_id = %req.node_id, "session opening");
        let (_session_id, rx) = self
            .dispatcher
            .register(&req.node_id, description)
            .await
            .map_err(Status::from)?;

        let stream = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let period = self
            .dispatcher
            .heartbeat(&req.node_id, &req.session_id)
            .map_err(Status::from)?;
        Ok(Response::new(HeartbeatResponse {
            period_secs: period.as_secs(),
        }))
    }

    async fn update_task_status(
        &self,
        request: Request<UpdateTaskStatusRequest>,
    ) -> Result<Response<UpdateTaskStatusResponse>, Status> {
        let req = request.into_inner();
        let mut updates: Vec<(String, TaskStatus)> = Vec::with_capacity(req.updates.len());
        for update in req.updates {
            let status: TaskStatus = serde_json::from_slice(&update.status)
                .map_err(|e| Status::invalid_argument(format!("status: {e}")))?;
            updates.push((update.task_id, status));
        }

        let acked = self
            .dispatcher
            .update_task_status(&req.node_id, &req.session_id, updates)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(UpdateTaskStatusResponse { acked }))
    }
}
