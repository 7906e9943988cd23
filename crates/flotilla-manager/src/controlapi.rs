//! Operator-facing CRUD over the object store.
//!
//! Every handler validates, then stages a store transaction; version
//! checks ride on the store's optimistic concurrency. Deletion ordering
//! is enforced here: a service with live tasks needs the cascade flag,
//! a node must be drained, a network must have no attachments.

use tonic::{Request, Response, Status};
use tracing::info;

use flotilla_proto::control::control_server::Control;
use flotilla_proto::control::*;
use flotilla_store::{
    new_id, Annotations, Cluster, ClusterSpec, Filter, Meta, Network, NetworkSpec, Node,
    NodeSpec, Service, ServiceMode, ServiceSpec, Store, StoreError, Task, TaskState, Volume,
    VolumeSpec,
};

#[derive(Clone)]
pub struct ControlApi {
    store: Store,
}

impl ControlApi {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn store_status(err: StoreError) -> Status {
    match &err {
        StoreError::NotFound(_) => Status::not_found(err.to_string()),
        StoreError::Exists(_) | StoreError::NameConflict(_) => {
            Status::already_exists(err.to_string())
        }
        StoreError::StaleVersion { .. } => Status::failed_precondition(err.to_string()),
        StoreError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        StoreError::Proposal(_) | StoreError::Closed => Status::unavailable(err.to_string()),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(value).map_err(|e| Status::internal(format!("encode: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, Status> {
    serde_json::from_slice(bytes)
        .map_err(|e| Status::invalid_argument(format!("invalid {what}: {e}")))
}

fn object_response<T: serde::Serialize>(value: &T) -> Result<Response<ObjectResponse>, Status> {
    Ok(Response::new(ObjectResponse {
        object: encode(value)?,
    }))
}

fn list_response<T: serde::Serialize>(values: &[T]) -> Result<Response<ListResponse>, Status> {
    let mut objects = Vec::with_capacity(values.len());
    for value in values {
        objects.push(encode(value)?);
    }
    Ok(Response::new(ListResponse { objects }))
}

fn validate_service_spec(spec: &ServiceSpec) -> Result<(), Status> {
    if spec.annotations.name.is_empty() {
        return Err(Status::invalid_argument("service name is required"));
    }
    if spec.task.container.image.is_empty() {
        return Err(Status::invalid_argument("container image is required"));
    }
    if let ServiceMode::Replicated { replicas } = spec.mode {
        if replicas == 0 {
            return Err(Status::invalid_argument(
                "replicated services need at least one replica",
            ));
        }
    }
    Ok(())
}

/// Filter list results per the request's optional selectors.
fn list_filter(req: &ListRequest) -> Filter {
    if !req.id_prefix.is_empty() {
        Filter::ByIdPrefix(req.id_prefix.clone())
    } else if !req.name_prefix.is_empty() {
        Filter::ByNamePrefix(req.name_prefix.clone())
    } else if !req.service_id.is_empty() {
        Filter::ByService(req.service_id.clone())
    } else if !req.node_id.is_empty() {
        Filter::ByNode(req.node_id.clone())
    } else {
        Filter::All
    }
}

#[tonic::async_trait]
impl Control for ControlApi {
    // ── Cluster ────────────────────────────────────────────────────

    async fn get_cluster(
        &self,
        _request: Request<GetClusterRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let cluster = self
            .store
            .view(|tx| tx.cluster())
            .ok_or_else(|| Status::not_found("cluster not bootstrapped"))?;
        object_response(&cluster)
    }

    async fn update_cluster(
        &self,
        request: Request<UpdateClusterRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: ClusterSpec = decode(&req.spec, "cluster spec")?;

        let cluster = self
            .store
            .view(|tx| tx.cluster())
            .ok_or_else(|| Status::not_found("cluster not bootstrapped"))?;
        let id = cluster.id.clone();
        self.store
            .update(move |tx| {
                let Some(mut cluster) = tx.get::<Cluster>(&id) else {
                    return Err(StoreError::NotFound(id.clone()));
                };
                cluster.meta.version = req.version;
                cluster.spec = spec.clone();
                tx.update(cluster)
            })
            .await
            .map_err(store_status)?;

        let cluster = self.store.view(|tx| tx.cluster()).expect("just updated");
        object_response(&cluster)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    async fn list_nodes(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let filter = list_filter(&request.into_inner());
        let nodes = self.store.view(|tx| tx.find::<Node>(&filter));
        list_response(&nodes)
    }

    async fn get_node(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let id = request.into_inner().id;
        let node = self
            .store
            .view(|tx| tx.get::<Node>(&id))
            .ok_or_else(|| Status::not_found(format!("node {id} not found")))?;
        object_response(&node)
    }

    async fn update_node(
        &self,
        request: Request<UpdateNodeRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: NodeSpec = decode(&req.spec, "node spec")?;
        let id = req.id.clone();

        self.store
            .update(move |tx| {
                let Some(mut node) = tx.get::<Node>(&id) else {
                    return Err(StoreError::NotFound(id.clone()));
                };
                // Membership only advances; a rejected or accepted node
                // cannot return to pending.
                if spec.membership < node.spec.membership {
                    return Err(StoreError::InvalidArgument(
                        "node membership cannot move backwards".into(),
                    ));
                }
                node.meta.version = req.version;
                node.spec = spec.clone();
                tx.update(node)
            })
            .await
            .map_err(store_status)?;

        let node = self
            .store
            .view(|tx| tx.get::<Node>(&req.id))
            .ok_or_else(|| Status::not_found("node vanished"))?;
        object_response(&node)
    }

    async fn remove_node(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let id = request.into_inner().id;

        let live = self.store.view(|tx| {
            tx.find::<Task>(&Filter::ByNode(id.clone()))
                .into_iter()
                .filter(|t| !t.is_terminal())
                .count()
        });
        if live > 0 {
            return Err(Status::failed_precondition(format!(
                "node {id} still runs {live} tasks; drain it first"
            )));
        }

        self.store
            .update(|tx| tx.delete::<Node>(&id))
            .await
            .map_err(store_status)?;
        Ok(Response::new(RemoveResponse {}))
    }

    // ── Services ───────────────────────────────────────────────────

    async fn create_service(
        &self,
        request: Request<CreateServiceRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: ServiceSpec = decode(&req.spec, "service spec")?;
        validate_service_spec(&spec)?;

        let service = Service {
            id: new_id(),
            meta: Meta {
                annotations: spec.annotations.clone(),
                ..Meta::default()
            },
            spec,
            endpoint: None,
        };
        let id = service.id.clone();
        self.store
            .update(|tx| tx.create(service))
            .await
            .map_err(store_status)?;

        info!(service_id = %id, "service created");
        let service = self
            .store
            .view(|tx| tx.get::<Service>(&id))
            .expect("just created");
        object_response(&service)
    }

    async fn get_service(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let id = request.into_inner().id;
        let service = self
            .store
            .view(|tx| {
                tx.get::<Service>(&id)
                    .or_else(|| tx.get_by_name::<Service>(&id))
            })
            .ok_or_else(|| Status::not_found(format!("service {id} not found")))?;
        object_response(&service)
    }

    async fn list_services(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let filter = list_filter(&request.into_inner());
        let services = self.store.view(|tx| tx.find::<Service>(&filter));
        list_response(&services)
    }

    async fn update_service(
        &self,
        request: Request<UpdateServiceRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: ServiceSpec = decode(&req.spec, "service spec")?;
        validate_service_spec(&spec)?;

        let id = req.id.clone();
        self.store
            .update(move |tx| {
                let Some(mut service) = tx.get::<Service>(&id) else {
                    return Err(StoreError::NotFound(id.clone()));
                };
                service.meta.version = req.version;
                service.meta.annotations = spec.annotations.clone();
                service.spec = spec.clone();
                tx.update(service)
            })
            .await
            .map_err(store_status)?;

        let service = self
            .store
            .view(|tx| tx.get::<Service>(&req.id))
            .ok_or_else(|| Status::not_found("service vanished"))?;
        object_response(&service)
    }

    async fn remove_service(
        &self,
        request: Request<RemoveServiceRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let req = request.into_inner();

        let live = self.store.view(|tx| {
            tx.find::<Task>(&Filter::ByService(req.id.clone()))
                .into_iter()
                .filter(|t| !t.is_terminal())
                .count()
        });
        if live > 0 && !req.cascade {
            return Err(Status::failed_precondition(format!(
                "service has {live} live tasks; pass cascade to remove anyway"
            )));
        }

        self.store
            .update(|tx| tx.delete::<Service>(&req.id))
            .await
            .map_err(store_status)?;
        info!(service_id = %req.id, cascade = req.cascade, "service removed");
        Ok(Response::new(RemoveResponse {}))
    }

    // ── Tasks ──────────────────────────────────────────────────────

    async fn get_task(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let id = request.into_inner().id;
        let task = self
            .store
            .view(|tx| tx.get::<Task>(&id))
            .ok_or_else(|| Status::not_found(format!("task {id} not found")))?;
        object_response(&task)
    }

    async fn list_tasks(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let filter = list_filter(&request.into_inner());
        let tasks = self.store.view(|tx| tx.find::<Task>(&filter));
        list_response(&tasks)
    }

    async fn remove_task(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let id = request.into_inner().id;
        self.store
            .update(move |tx| {
                let Some(mut task) = tx.get::<Task>(&id) else {
                    return Err(StoreError::NotFound(id.clone()));
                };
                if task.is_terminal() {
                    // Already stopped; delete outright.
                    return tx.delete::<Task>(&id);
                }
                // Running tasks drain through the agent and reaper.
                if task.desired_state < TaskState::Remove {
                    task.desired_state = TaskState::Remove;
                    tx.update(task)?;
                }
                Ok(())
            })
            .await
            .map_err(store_status)?;
        Ok(Response::new(RemoveResponse {}))
    }

    // ── Networks ───────────────────────────────────────────────────

    async fn create_network(
        &self,
        request: Request<CreateNetworkRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: NetworkSpec = decode(&req.spec, "network spec")?;
        if spec.annotations.name.is_empty() {
            return Err(Status::invalid_argument("network name is required"));
        }

        let network = Network {
            id: new_id(),
            meta: Meta {
                annotations: spec.annotations.clone(),
                ..Meta::default()
            },
            spec,
            driver_state: None,
            ipam: None,
        };
        let id = network.id.clone();
        self.store
            .update(|tx| tx.create(network))
            .await
            .map_err(store_status)?;

        let network = self
            .store
            .view(|tx| tx.get::<Network>(&id))
            .expect("just created");
        object_response(&network)
    }

    async fn get_network(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let id = request.into_inner().id;
        let network = self
            .store
            .view(|tx| {
                tx.get::<Network>(&id)
                    .or_else(|| tx.get_by_name::<Network>(&id))
            })
            .ok_or_else(|| Status::not_found(format!("network {id} not found")))?;
        object_response(&network)
    }

    async fn list_networks(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let filter = list_filter(&request.into_inner());
        let networks = self.store.view(|tx| tx.find::<Network>(&filter));
        list_response(&networks)
    }

    async fn remove_network(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let id = request.into_inner().id;

        let attached = self.store.view(|tx| {
            tx.find::<Task>(&Filter::All)
                .into_iter()
                .filter(|t| !t.is_terminal())
                .any(|t| t.networks.iter().any(|a| a.network_id == id))
        });
        if attached {
            return Err(Status::failed_precondition(
                "network still has attached tasks",
            ));
        }

        self.store
            .update(|tx| tx.delete::<Network>(&id))
            .await
            .map_err(store_status)?;
        Ok(Response::new(RemoveResponse {}))
    }

    // ── Volumes ────────────────────────────────────────────────────

    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let req = request.into_inner();
        let spec: VolumeSpec = decode(&req.spec, "volume spec")?;
        if spec.annotations.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }

        let volume = Volume {
            id: new_id(),
            meta: Meta {
                annotations: Annotations {
                    name: spec.annotations.name.clone(),
                    labels: spec.annotations.labels.clone(),
                },
                ..Meta::default()
            },
            spec,
        };
        let id = volume.id.clone();
        self.store
            .update(|tx| tx.create(volume))
            .await
            .map_err(store_status)?;

        let volume = self
            .store
            .view(|tx| tx.get::<Volume>(&id))
            .expect("just created");
        object_response(&volume)
    }

    async fn get_volume(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<ObjectResponse>, Status> {
        let id = request.into_inner().id;
        let volume = self
            .store
            .view(|tx| {
                tx.get::<Volume>(&id)
                    .or_else(|| tx.get_by_name::<Volume>(&id))
            })
            .ok_or_else(|| Status::not_found(format!("volume {id} not found")))?;
        object_response(&volume)
    }

    async fn list_volumes(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let filter = list_filter(&request.into_inner());
        let volumes = self.store.view(|tx| tx.find::<Volume>(&filter));
        list_response(&volumes)
    }

    async fn remove_volume(
        &self,
        request: Request<RemoveByIdRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let id = request.into_inner().id;

        let referenced = self.store.view(|tx| {
            tx.find::<Task>(&Filter::All)
                .into_iter()
                .filter(|t| !t.is_terminal())
                .any(|t| {
                    t.spec
                        .container
                        .mounts
                        .iter()
                        .any(|m| m.volume_id.as_deref() == Some(id.as_str()))
                })
        });
        if referenced {
            return Err(Status::failed_precondition(
                "volume is still mounted by live tasks",
            ));
        }

        self.store
            .update(|tx| tx.delete::<Volume>(&id))
            .await
            .map_err(store_status)?;
        Ok(Response::new(RemoveResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{ContainerSpec, TaskSpec, TaskStatus};

    fn api() -> ControlApi {
        ControlApi::new(Store::new())
    }

    fn service_spec(name: &str, replicas: u64) -> ServiceSpec {
        ServiceSpec {
            annotations: Annotations::named(name),
            task: TaskSpec {
                container: ContainerSpec {
                    image: "nginx:1.27".into(),
                    ..ContainerSpec::default()
                },
                ..TaskSpec::default()
            },
            mode: ServiceMode::Replicated { replicas },
            update: None,
            endpoint: None,
        }
    }

    async fn create_service_via_api(api: &ControlApi, name: &str) -> Service {
        let response = api
            .create_service(Request::new(CreateServiceRequest {
                spec: serde_json::to_vec(&service_spec(name, 2)).unwrap(),
            }))
            .await
            .unwrap();
        serde_json::from_slice(&response.into_inner().object).unwrap()
    }

    #[tokio::test]
    async fn create_get_list_service() {
        let api = api();
        let created = create_service_via_api(&api, "web").await;
        assert_eq!(created.spec.annotations.name, "web");
        assert_eq!(created.meta.version, 1);

        let fetched = api
            .get_service(Request::new(GetByIdRequest {
                id: created.id.clone(),
            }))
            .await
            .unwrap();
        let fetched: Service = serde_json::from_slice(&fetched.into_inner().object).unwrap();
        assert_eq!(fetched.id, created.id);

        // Lookup by name works too.
        let by_name = api
            .get_service(Request::new(GetByIdRequest { id: "web".into() }))
            .await
            .unwrap();
        let by_name: Service = serde_json::from_slice(&by_name.into_inner().object).unwrap();
        assert_eq!(by_name.id, created.id);

        let listed = api
            .list_services(Request::new(ListRequest::default()))
            .await
            .unwrap();
        assert_eq!(listed.into_inner().objects.len(), 1);
    }

    #[tokio::test]
    async fn invalid_service_specs_rejected() {
        let api = api();

        let unnamed = api
            .create_service(Request::new(CreateServiceRequest {
                spec: serde_json::to_vec(&service_spec("", 1)).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(unnamed.code(), tonic::Code::InvalidArgument);

        let zero = api
            .create_service(Request::new(CreateServiceRequest {
                spec: serde_json::to_vec(&service_spec("web", 0)).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(zero.code(), tonic::Code::InvalidArgument);

        let mut no_image = service_spec("web", 1);
        no_image.task.container.image.clear();
        let no_image = api
            .create_service(Request::new(CreateServiceRequest {
                spec: serde_json::to_vec(&no_image).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(no_image.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn duplicate_service_name_conflicts() {
        let api = api();
        create_service_via_api(&api, "web").await;

        let err = api
            .create_service(Request::new(CreateServiceRequest {
                spec: serde_json::to_vec(&service_spec("web", 1)).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn update_requires_current_version() {
        let api = api();
        let created = create_service_via_api(&api, "web").await;

        // Correct version succeeds.
        api.update_service(Request::new(UpdateServiceRequest {
            id: created.id.clone(),
            version: created.meta.version,
            spec: serde_json::to_vec(&service_spec("web", 3)).unwrap(),
        }))
        .await
        .unwrap();

        // Replaying the same version now fails.
        let err = api
            .update_service(Request::new(UpdateServiceRequest {
                id: created.id.clone(),
                version: created.meta.version,
                spec: serde_json::to_vec(&service_spec("web", 4)).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn remove_service_with_live_tasks_needs_cascade() {
        let api = api();
        let created = create_service_via_api(&api, "web").await;

        let task = Task {
            id: new_id(),
            meta: Meta::default(),
            service_id: created.id.clone(),
            slot: 1,
            node_id: Some("n1".into()),
            spec: TaskSpec::default(),
            spec_version: 1,
            desired_state: TaskState::Running,
            status: TaskStatus {
                state: TaskState::Running,
                ..TaskStatus::default()
            },
            networks: Vec::new(),
            endpoint: None,
        };
        api.store().update(|tx| tx.create(task)).await.unwrap();

        let err = api
            .remove_service(Request::new(RemoveServiceRequest {
                id: created.id.clone(),
                cascade: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        api.remove_service(Request::new(RemoveServiceRequest {
            id: created.id.clone(),
            cascade: true,
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn remove_task_drains_running_ones() {
        let api = api();
        let task = Task {
            id: "t1".into(),
            meta: Meta::default(),
            service_id: "s1".into(),
            slot: 1,
            node_id: Some("n1".into()),
            spec: TaskSpec::default(),
            spec_version: 1,
            desired_state: TaskState::Running,
            status: TaskStatus {
                state: TaskState::Running,
                ..TaskStatus::default()
            },
            networks: Vec::new(),
            endpoint: None,
        };
        api.store().update(|tx| tx.create(task)).await.unwrap();

        api.remove_task(Request::new(RemoveByIdRequest { id: "t1".into() }))
            .await
            .unwrap();

        // Still present, draining.
        let task = api.store().view(|tx| tx.get::<Task>("t1")).unwrap();
        assert_eq!(task.desired_state, TaskState::Remove);
    }

    #[tokio::test]
    async fn unknown_lookups_are_not_found() {
        let api = api();
        let err = api
            .get_service(Request::new(GetByIdRequest { id: "nope".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let err = api
            .get_cluster(Request::new(GetClusterRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
