//! The allocation loop.
//!
//! Event-driven against the store, with all pool state reconstructible
//! from persisted objects: on start (or event lag) the allocator
//! re-claims every subnet, address and port it finds, so a leader
//! change never double-allocates.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_store::{
    DriverState, Endpoint, EndpointVip, Filter, IpamState, Kind, Network, NetworkAttachment,
    Object, Service, Store, StoreEvent, Task, TaskState, Volume, WatchError,
};

use crate::error::AllocatorResult;
use crate::ipam::{AddressSpace, SubnetPool};
use crate::ports::PortAllocator;

const DEFAULT_DRIVER: &str = "overlay";

pub struct Allocator {
    store: Store,
    space: AddressSpace,
    /// network id → its host-address pool.
    pools: HashMap<String, SubnetPool>,
    ports: PortAllocator,
    /// Tasks whose networks were not allocatable yet.
    deferred: HashMap<String, Task>,
}

impl Allocator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            space: AddressSpace::new(),
            pools: HashMap::new(),
            ports: PortAllocator::new(),
            deferred: HashMap::new(),
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AllocatorResult<()> {
        let mut events = self.store.watch_where(|e| {
            matches!(e.kind(), Kind::Network | Kind::Service | Kind::Task)
        });

        self.sync().await?;
        info!(
            networks = self.pools.len(),
            ports = self.ports.in_use(),
            "allocator started"
        );

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Ok(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            warn!(error = %err, "allocation failed; will retry on next event");
                        }
                    }
                    Err(WatchError::Lagged(n)) => {
                        warn!(missed = n, "allocator lagged; resyncing");
                        events = self.store.watch_where(|e| {
                            matches!(e.kind(), Kind::Network | Kind::Service | Kind::Task)
                        });
                        self.sync().await?;
                    }
                    Err(WatchError::Closed) => return Ok(()),
                },
                _ = shutdown.changed() => {
                    info!("allocator shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Rebuild pool state from the store, then work every backlog item.
    pub async fn sync(&mut self) -> AllocatorResult<()> {
        self.space = AddressSpace::new();
        self.pools.clear();
        self.ports = PortAllocator::new();
        self.deferred.clear();

        let (networks, services, tasks) = self.store.view(|tx| {
            (
                tx.find::<Network>(&Filter::All),
                tx.find::<Service>(&Filter::All),
                tx.find::<Task>(&Filter::All),
            )
        });

        for network in &networks {
            if let Some(ipam) = &network.ipam {
                self.space.claim_subnet(&ipam.subnet)?;
                self.pools
                    .insert(network.id.clone(), SubnetPool::new(&ipam.subnet)?);
            }
        }
        for task in &tasks {
            for attachment in &task.networks {
                if let Some(pool) = self.pools.get_mut(&attachment.network_id) {
                    for addr in &attachment.addresses {
                        if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                            let _ = pool.claim(ip);
                        }
                    }
                }
            }
        }
        for service in &services {
            if let Some(endpoint) = &service.endpoint {
                for port in &endpoint.ports {
                    self.ports.claim(port.published_port);
                }
                for vip in &endpoint.virtual_ips {
                    if let (Some(pool), Ok(ip)) = (
                        self.pools.get_mut(&vip.network_id),
                        vip.addr.parse::<Ipv4Addr>(),
                    ) {
                        let _ = pool.claim(ip);
                    }
                }
            }
        }

        // Backlog: unallocated networks, services, tasks.
        for network in networks {
            if network.ipam.is_none() {
                self.allocate_network(&network).await?;
            }
        }
        for service in services {
            self.allocate_service(&service).await?;
        }
        for task in tasks {
            if task.status.state == TaskState::New {
                self.allocate_task(task).await?;
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: StoreEvent) -> AllocatorResult<()> {
        match event {
            StoreEvent::Created(Object::Network(network)) => {
                if network.ipam.is_none() {
                    self.allocate_network(&network).await?;
                    self.retry_deferred().await?;
                }
            }
            StoreEvent::Deleted(Object::Network(network)) => {
                self.network_deleted(&network)?;
            }
            StoreEvent::Created(Object::Service(service))
            | StoreEvent::Updated(Object::Service(service)) => {
                self.allocate_service(&service).await?;
            }
            StoreEvent::Deleted(Object::Service(service)) => {
                self.service_deleted(&service);
            }
            StoreEvent::Created(Object::Task(task)) => {
                if task.status.state == TaskState::New {
                    self.allocate_task(task).await?;
                }
            }
            StoreEvent::Deleted(Object::Task(task)) => {
                self.release_task(&task);
            }
            _ => {}
        }
        Ok(())
    }

    /// Give a network its driver state and subnet pool.
    async fn allocate_network(&mut self, network: &Network) -> AllocatorResult<()> {
        let (subnet, gateway) = match &network.spec.ipam.subnet {
            Some(requested) => {
                self.space.claim_subnet(requested)?;
                let (addr, _) = crate::ipam::parse_cidr(requested)?;
                let gateway = network
                    .spec
                    .ipam
                    .gateway
                    .clone()
                    .unwrap_or_else(|| Ipv4Addr::from(u32::from(addr) + 1).to_string());
                (requested.clone(), gateway)
            }
            None => self.space.allocate_subnet()?,
        };

        self.pools
            .insert(network.id.clone(), SubnetPool::new(&subnet)?);

        let network_id = network.id.clone();
        let driver = network
            .spec
            .driver
            .as_ref()
            .map(|d| d.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DRIVER.to_string());
        let ipam = IpamState {
            subnet: subnet.clone(),
            gateway,
        };
        self.store
            .update(move |tx| {
                let Some(mut network) = tx.get::<Network>(&network_id) else {
                    return Ok(());
                };
                if network.ipam.is_some() {
                    return Ok(());
                }
                network.driver_state = Some(DriverState {
                    name: driver.clone(),
                    options: Default::default(),
                });
                network.ipam = Some(ipam.clone());
                tx.update(network)
            })
            .await?;

        info!(network_id = %network.id, %subnet, "network allocated");
        Ok(())
    }

    /// A deleted network's pool is dropped once its last address is
    /// released; a still-populated pool lingers until tasks drain.
    fn network_deleted(&mut self, network: &Network) -> AllocatorResult<()> {
        let Some(pool) = self.pools.get(&network.id) else {
            return Ok(());
        };
        if pool.in_use() > 0 {
            debug!(
                network_id = %network.id,
                in_use = pool.in_use(),
                "network deleted with live endpoints; deferring pool release"
            );
            return Ok(());
        }
        let pool = self.pools.remove(&network.id).expect("checked above");
        self.space.release_subnet(&pool.subnet())?;
        info!(network_id = %network.id, "network pool released");
        Ok(())
    }

    /// Allocate published ports (and VIPs on referenced networks) for a
    /// service's endpoint.
    async fn allocate_service(&mut self, service: &Service) -> AllocatorResult<()> {
        let Some(spec) = &service.spec.endpoint else {
            return Ok(());
        };
        let current = service.endpoint.as_ref();
        if current.is_some_and(|e| e.spec == *spec) {
            return Ok(());
        }

        let mut ports = Vec::with_capacity(spec.ports.len());
        for config in &spec.ports {
            let already = current.and_then(|e| {
                e.ports
                    .iter()
                    .find(|p| p.name == config.name && p.target_port == config.target_port)
            });
            let published = match already {
                Some(existing) => existing.published_port,
                None => self.ports.allocate(config.published_port)?,
            };
            let mut allocated = config.clone();
            allocated.published_port = published;
            ports.push(allocated);
        }

        let mut virtual_ips = current.map(|e| e.virtual_ips.clone()).unwrap_or_default();
        for attachment in &service.spec.task.networks {
            let Some(network_id) = self.resolve_network(&attachment.target) else {
                continue;
            };
            if virtual_ips.iter().any(|v| v.network_id == network_id) {
                continue;
            }
            if let Some(pool) = self.pools.get_mut(&network_id) {
                let addr = pool.allocate()?;
                virtual_ips.push(EndpointVip {
                    network_id,
                    addr: addr.to_string(),
                });
            }
        }

        let endpoint = Endpoint {
            spec: spec.clone(),
            ports,
            virtual_ips,
        };
        let service_id = service.id.clone();
        self.store
            .update(move |tx| {
                let Some(mut service) = tx.get::<Service>(&service_id) else {
                    return Ok(());
                };
                service.endpoint = Some(endpoint.clone());
                tx.update(service)
            })
            .await?;
        Ok(())
    }

    fn service_deleted(&mut self, service: &Service) {
        let Some(endpoint) = &service.endpoint else {
            return;
        };
        for port in &endpoint.ports {
            self.ports.release(port.published_port);
        }
        for vip in &endpoint.virtual_ips {
            if let (Some(pool), Ok(ip)) = (
                self.pools.get_mut(&vip.network_id),
                vip.addr.parse::<Ipv4Addr>(),
            ) {
                pool.release(ip);
            }
        }
    }

    /// Give a task its attachments and volume bindings, then advance it
    /// to `Allocated`. Tasks referencing not-yet-allocated networks are
    /// parked and retried when network allocations land.
    async fn allocate_task(&mut self, task: Task) -> AllocatorResult<()> {
        // Resolve every referenced network first; a single unready
        // network parks the whole task.
        let mut resolved = Vec::with_capacity(task.spec.networks.len());
        for config in &task.spec.networks {
            match self.resolve_network(&config.target) {
                Some(network_id) if self.pools.contains_key(&network_id) => {
                    resolved.push(network_id);
                }
                _ => {
                    debug!(task_id = %task.id, target = %config.target, "network not ready; deferring task");
                    self.deferred.insert(task.id.clone(), task);
                    return Ok(());
                }
            }
        }

        let mut attachments = Vec::with_capacity(resolved.len());
        for network_id in resolved {
            let pool = self.pools.get_mut(&network_id).expect("resolved above");
            let addr = pool.allocate()?;
            attachments.push(NetworkAttachment {
                network_id,
                addresses: vec![addr.to_string()],
            });
        }

        // Bind named volumes to ids.
        let volume_bindings: HashMap<String, String> = self.store.view(|tx| {
            task.spec
                .container
                .mounts
                .iter()
                .filter(|m| m.volume_id.is_none() && !m.source.is_empty())
                .filter_map(|m| {
                    tx.get_by_name::<Volume>(&m.source)
                        .map(|v| (m.source.clone(), v.id))
                })
                .collect()
        });

        let task_id = task.id.clone();
        let staged_attachments = attachments.clone();
        self.store
            .update(move |tx| {
                let Some(mut task) = tx.get::<Task>(&task_id) else {
                    return Ok(());
                };
                if task.status.state != TaskState::New {
                    return Ok(());
                }
                task.networks = staged_attachments.clone();
                for mount in &mut task.spec.container.mounts {
                    if mount.volume_id.is_none() {
                        if let Some(id) = volume_bindings.get(&mount.source) {
                            mount.volume_id = Some(id.clone());
                        }
                    }
                }
                task.status.state = TaskState::Allocated;
                task.status.timestamp = flotilla_store::epoch_secs();
                tx.update(task)
            })
            .await?;

        debug!(task_id = %task.id, "task allocated");
        Ok(())
    }

    fn release_task(&mut self, task: &Task) {
        self.deferred.remove(&task.id);
        let mut emptied: Vec<String> = Vec::new();
        for attachment in &task.networks {
            if let Some(pool) = self.pools.get_mut(&attachment.network_id) {
                for addr in &attachment.addresses {
                    if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                        pool.release(ip);
                    }
                }
                if pool.in_use() == 0 {
                    emptied.push(attachment.network_id.clone());
                }
            }
        }

        // Pools for networks deleted earlier release once drained.
        for network_id in emptied {
            let gone = self
                .store
                .view(|tx| tx.get::<Network>(&network_id).is_none());
            if gone {
                if let Some(pool) = self.pools.remove(&network_id) {
                    let _ = self.space.release_subnet(&pool.subnet());
                    info!(%network_id, "drained pool released");
                }
            }
        }
    }

    async fn retry_deferred(&mut self) -> AllocatorResult<()> {
        let parked: Vec<Task> = self.deferred.drain().map(|(_, t)| t).collect();
        for task in parked {
            // Refresh: the task may be gone or already allocated.
            let fresh = self.store.view(|tx| tx.get::<Task>(&task.id));
            if let Some(fresh) = fresh {
                if fresh.status.state == TaskState::New {
                    self.allocate_task(fresh).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a network reference (id or name) to an id.
    fn resolve_network(&self, target: &str) -> Option<String> {
        self.store.view(|tx| {
            if let Some(network) = tx.get::<Network>(target) {
                return Some(network.id);
            }
            tx.get_by_name::<Network>(target).map(|n| n.id)
        })
    }
}
