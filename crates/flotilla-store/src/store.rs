//! Transactions and commit routing.
//!
//! Reads run against a consistent snapshot under a shared lock. Writes
//! collect [`StoreAction`]s in an overlay without touching committed
//! state; at commit the batch either goes through the configured
//! [`ProposalRouter`] (Raft, on managers) or is applied directly
//! (single-node stores and the Raft apply loop itself). Application is
//! the single mutation point: it validates, bumps versions from the
//! commit counter, and publishes events, so every member materializes an
//! identical store from the same entry sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::index::{Filter, ObjectTable};
use crate::object::{Kind, Object, StoreAction, StoreObject};
use crate::objects::*;
use crate::watch::{EventBus, EventStream, StoreEvent};

/// Default capacity of the event bus.
const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Routes a committed write batch through consensus.
///
/// The returned future resolves once the proposal has been applied to the
/// local store (or failed). Implemented by the Raft node.
pub trait ProposalRouter: Send + Sync {
    fn propose(&self, actions: Vec<StoreAction>) -> BoxFuture<'static, Result<(), ProposalError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("lost leadership")]
    LostLeadership,

    #[error("raft stopped")]
    Stopped,

    #[error("proposal too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("{0}")]
    Rejected(String),
}

// ── State ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    pub(crate) commit_index: u64,
    pub(crate) clusters: ObjectTable<Cluster>,
    pub(crate) nodes: ObjectTable<Node>,
    pub(crate) services: ObjectTable<Service>,
    pub(crate) tasks: ObjectTable<Task>,
    pub(crate) networks: ObjectTable<Network>,
    pub(crate) volumes: ObjectTable<Volume>,
    pub(crate) resources: ObjectTable<Resource>,
    pub(crate) extensions: ObjectTable<Extension>,
}

impl StoreState {
    fn get_object(&self, kind: Kind, id: &str) -> Option<Object> {
        match kind {
            Kind::Cluster => self.clusters.get(id).cloned().map(Object::Cluster),
            Kind::Node => self.nodes.get(id).cloned().map(Object::Node),
            Kind::Service => self.services.get(id).cloned().map(Object::Service),
            Kind::Task => self.tasks.get(id).cloned().map(Object::Task),
            Kind::Network => self.networks.get(id).cloned().map(Object::Network),
            Kind::Volume => self.volumes.get(id).cloned().map(Object::Volume),
            Kind::Resource => self.resources.get(id).cloned().map(Object::Resource),
            Kind::Extension => self.extensions.get(id).cloned().map(Object::Extension),
        }
    }

    fn put_object(&mut self, obj: Object) {
        match obj {
            Object::Cluster(o) => self.clusters.put(o),
            Object::Node(o) => self.nodes.put(o),
            Object::Service(o) => self.services.put(o),
            Object::Task(o) => self.tasks.put(o),
            Object::Network(o) => self.networks.put(o),
            Object::Volume(o) => self.volumes.put(o),
            Object::Resource(o) => self.resources.put(o),
            Object::Extension(o) => self.extensions.put(o),
        }
    }

    fn remove_object(&mut self, kind: Kind, id: &str) -> Option<Object> {
        match kind {
            Kind::Cluster => self.clusters.remove(id).map(Object::Cluster),
            Kind::Node => self.nodes.remove(id).map(Object::Node),
            Kind::Service => self.services.remove(id).map(Object::Service),
            Kind::Task => self.tasks.remove(id).map(Object::Task),
            Kind::Network => self.networks.remove(id).map(Object::Network),
            Kind::Volume => self.volumes.remove(id).map(Object::Volume),
            Kind::Resource => self.resources.remove(id).map(Object::Resource),
            Kind::Extension => self.extensions.remove(id).map(Object::Extension),
        }
    }

    fn id_by_name(&self, kind: Kind, name: &str) -> Option<&ObjectId> {
        match kind {
            Kind::Cluster => self.clusters.id_by_name(name),
            Kind::Node => self.nodes.id_by_name(name),
            Kind::Service => self.services.id_by_name(name),
            Kind::Task => self.tasks.id_by_name(name),
            Kind::Network => self.networks.id_by_name(name),
            Kind::Volume => self.volumes.id_by_name(name),
            Kind::Resource => self.resources.id_by_name(name),
            Kind::Extension => self.extensions.id_by_name(name),
        }
    }

    fn table<T: StoreObject>(&self) -> &ObjectTable<T> {
        // Closed kind set; each arm transmutes only to its own table type.
        let any: &dyn std::any::Any = match T::KIND {
            Kind::Cluster => &self.clusters,
            Kind::Node => &self.nodes,
            Kind::Service => &self.services,
            Kind::Task => &self.tasks,
            Kind::Network => &self.networks,
            Kind::Volume => &self.volumes,
            Kind::Resource => &self.resources,
            Kind::Extension => &self.extensions,
        };
        any.downcast_ref::<ObjectTable<T>>()
            .expect("kind/table mismatch")
    }
}

// ── Read transactions ─────────────────────────────────────────────

/// A consistent read snapshot. Holds the store's shared lock for its
/// lifetime, so keep view closures short.
pub struct ReadTx<'a> {
    state: &'a StoreState,
}

impl ReadTx<'_> {
    pub fn get<T: StoreObject>(&self, id: &str) -> Option<T> {
        self.state.table::<T>().get(id).cloned()
    }

    pub fn find<T: StoreObject>(&self, filter: &Filter) -> Vec<T> {
        self.state.table::<T>().find(filter)
    }

    pub fn get_by_name<T: StoreObject>(&self, name: &str) -> Option<T> {
        let id = self.state.id_by_name(T::KIND, name)?;
        self.get(id)
    }

    pub fn count<T: StoreObject>(&self) -> usize {
        self.state.table::<T>().len()
    }

    /// The singleton cluster object, if bootstrapped.
    pub fn cluster(&self) -> Option<Cluster> {
        self.state.clusters.iter().next().cloned()
    }

    /// Index of the last applied commit.
    pub fn commit_index(&self) -> u64 {
        self.state.commit_index
    }
}

// ── Write transactions ────────────────────────────────────────────

/// Collects actions against an overlay of the committed state.
///
/// Nothing is visible to readers until the batch commits; repeated
/// writes to the same object within one transaction coalesce into a
/// single action.
pub struct WriteTx<'a> {
    state: &'a StoreState,
    /// (kind, id) → pending value; `None` marks deletion.
    overlay: HashMap<(Kind, ObjectId), Option<Object>>,
    /// First-touch order, for deterministic action and event order.
    touched: Vec<(Kind, ObjectId)>,
    now: u64,
}

impl<'a> WriteTx<'a> {
    fn new(state: &'a StoreState) -> Self {
        Self {
            state,
            overlay: HashMap::new(),
            touched: Vec::new(),
            now: crate::epoch_secs(),
        }
    }

    /// Current value as seen by this transaction.
    pub fn get<T: StoreObject>(&self, id: &str) -> Option<T> {
        match self.overlay.get(&(T::KIND, id.to_string())) {
            Some(Some(obj)) => T::from_object(obj.clone()),
            Some(None) => None,
            None => self.state.table::<T>().get(id).cloned(),
        }
    }

    pub fn get_by_name<T: StoreObject>(&self, name: &str) -> Option<T> {
        // Overlay writes win over the committed name index.
        for (kind, id) in self.touched.iter().rev() {
            if *kind != T::KIND {
                continue;
            }
            if let Some(Some(obj)) = self.overlay.get(&(*kind, id.clone())) {
                if let Some(t) = T::from_object(obj.clone()) {
                    if t.name() == name {
                        return Some(t);
                    }
                }
            }
        }
        let id = self.state.id_by_name(T::KIND, name)?.clone();
        self.get(&id)
    }

    /// Committed results merged with this transaction's pending writes.
    pub fn find<T: StoreObject>(&self, filter: &Filter) -> Vec<T> {
        let mut out: Vec<T> = self
            .state
            .table::<T>()
            .find(filter)
            .into_iter()
            .filter(|obj| !self.overlay.contains_key(&(T::KIND, obj.id().to_string())))
            .collect();
        for (kind, id) in &self.touched {
            if *kind != T::KIND {
                continue;
            }
            if let Some(Some(obj)) = self.overlay.get(&(*kind, id.clone())) {
                if let Some(t) = T::from_object(obj.clone()) {
                    if filter.matches(&t) {
                        out.push(t);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Stage a creation. Fails if the id or name is already taken.
    pub fn create<T: StoreObject>(&mut self, mut obj: T) -> StoreResult<()> {
        if obj.id().is_empty() {
            return Err(StoreError::InvalidArgument("empty object id".into()));
        }
        if self.get::<T>(obj.id()).is_some() {
            return Err(StoreError::Exists(obj.id().to_string()));
        }
        self.check_name_free::<T>(obj.name(), obj.id())?;

        let meta = obj.meta_mut();
        meta.version = 0;
        meta.created_at = self.now;
        meta.updated_at = self.now;
        self.stage(obj.into_object());
        Ok(())
    }

    /// Stage an update. The object must carry the version the caller read.
    pub fn update<T: StoreObject>(&mut self, mut obj: T) -> StoreResult<()> {
        let current = self
            .get::<T>(obj.id())
            .ok_or_else(|| StoreError::NotFound(obj.id().to_string()))?;
        if current.meta().version != obj.meta().version {
            return Err(StoreError::StaleVersion {
                id: obj.id().to_string(),
                have: obj.meta().version,
                stored: current.meta().version,
            });
        }
        if obj.name() != current.name() {
            self.check_name_free::<T>(obj.name(), obj.id())?;
        }
        obj.meta_mut().updated_at = self.now;
        self.stage(obj.into_object());
        Ok(())
    }

    /// Stage a deletion.
    pub fn delete<T: StoreObject>(&mut self, id: &str) -> StoreResult<()> {
        if self.get::<T>(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let key = (T::KIND, id.to_string());
        if !self.overlay.contains_key(&key) {
            self.touched.push(key.clone());
        }
        self.overlay.insert(key, None);
        Ok(())
    }

    fn stage(&mut self, obj: Object) {
        let key = (obj.kind(), obj.id().to_string());
        if !self.overlay.contains_key(&key) {
            self.touched.push(key.clone());
        }
        self.overlay.insert(key, Some(obj));
    }

    fn check_name_free<T: StoreObject>(&self, name: &str, own_id: &str) -> StoreResult<()> {
        if name.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.get_by_name::<T>(name) {
            if existing.id() != own_id {
                return Err(StoreError::NameConflict(name.to_string()));
            }
        }
        Ok(())
    }

    /// Coalesced actions, in first-touch order.
    fn into_actions(self) -> Vec<StoreAction> {
        let mut actions = Vec::with_capacity(self.touched.len());
        for key in &self.touched {
            let existed = self.state.get_object(key.0, &key.1).is_some();
            match self.overlay.get(key) {
                Some(Some(obj)) if existed => actions.push(StoreAction::Update(obj.clone())),
                Some(Some(obj)) => actions.push(StoreAction::Create(obj.clone())),
                Some(None) if existed => actions.push(StoreAction::Delete {
                    kind: key.0,
                    id: key.1.clone(),
                }),
                // Created and deleted within the same transaction: no-op.
                Some(None) | None => {}
            }
        }
        actions
    }
}

// ── Store ─────────────────────────────────────────────────────────

/// The shared object store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<RwLock<StoreState>>,
    bus: EventBus,
    router: Arc<Mutex<Option<Arc<dyn ProposalRouter>>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// A store that commits locally (single node, followers, tests).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState::default())),
            bus: EventBus::new(DEFAULT_WATCH_CAPACITY),
            router: Arc::new(Mutex::new(None)),
        }
    }

    /// Install the consensus router. Subsequent write transactions are
    /// proposed instead of applied directly.
    pub fn set_router(&self, router: Arc<dyn ProposalRouter>) {
        *self.router.lock().unwrap() = Some(router);
    }

    /// Remove the consensus router (demotion to follower: the Raft apply
    /// loop becomes the only writer).
    pub fn clear_router(&self) {
        *self.router.lock().unwrap() = None;
    }

    /// Run a read transaction against a consistent snapshot.
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx<'_>) -> R) -> R {
        let state = self.inner.read().unwrap();
        let tx = ReadTx { state: &state };
        f(&tx)
    }

    /// Run a write transaction.
    ///
    /// The closure stages actions against an overlay; on success the
    /// batch is committed through the router (when installed) or applied
    /// directly. The call resolves once the batch is visible locally.
    pub async fn update<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut WriteTx<'_>) -> StoreResult<()>,
    {
        let actions = {
            let state = self.inner.read().unwrap();
            let mut tx = WriteTx::new(&state);
            f(&mut tx)?;
            tx.into_actions()
        };
        if actions.is_empty() {
            return Ok(());
        }
        self.commit(actions).await
    }

    /// Commit a pre-built action batch (used by `update` and by callers
    /// that split oversized transactions with [`Store::batch`]).
    pub async fn commit(&self, actions: Vec<StoreAction>) -> StoreResult<()> {
        let router = self.router.lock().unwrap().clone();
        match router {
            Some(router) => router.propose(actions).await.map_err(|err| match err {
                ProposalError::Rejected(msg) => StoreError::Proposal(msg),
                other => StoreError::Proposal(other.to_string()),
            }),
            None => self.apply_actions(&actions),
        }
    }

    /// Apply a committed batch to the local state.
    ///
    /// This is the only mutation point: called with locally-validated
    /// batches on single-node stores, and by the Raft apply loop for every
    /// committed entry on every member. Validation failure rejects the
    /// whole batch and mutates nothing, so all members agree on the
    /// outcome of every entry.
    pub fn apply_actions(&self, actions: &[StoreAction]) -> StoreResult<()> {
        let mut state = self.inner.write().unwrap();
        Self::validate(&state, actions)?;

        state.commit_index += 1;
        let version = state.commit_index;

        let mut events = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                StoreAction::Create(obj) => {
                    let mut obj = obj.clone();
                    obj.meta_mut().version = version;
                    state.put_object(obj.clone());
                    events.push(StoreEvent::Created(obj));
                }
                StoreAction::Update(obj) => {
                    let mut obj = obj.clone();
                    obj.meta_mut().version = version;
                    state.put_object(obj.clone());
                    events.push(StoreEvent::Updated(obj));
                }
                StoreAction::Delete { kind, id } => {
                    if let Some(old) = state.remove_object(*kind, id) {
                        events.push(StoreEvent::Deleted(old));
                    }
                }
            }
        }
        drop(state);

        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Re-validate a batch against current state. The proposer validated
    /// against its read snapshot, but an interleaved commit may have
    /// invalidated the batch by the time it reaches the log. Actions are
    /// checked in batch order, so a name freed by an earlier delete in
    /// the same batch is usable by a later create.
    fn validate(state: &StoreState, actions: &[StoreAction]) -> StoreResult<()> {
        let mut deleted: std::collections::HashSet<(Kind, &str)> =
            std::collections::HashSet::new();
        let mut claimed_names: std::collections::HashSet<(Kind, &str)> =
            std::collections::HashSet::new();

        for action in actions {
            match action {
                StoreAction::Create(obj) => {
                    let kind = obj.kind();
                    if state.get_object(kind, obj.id()).is_some()
                        && !deleted.contains(&(kind, obj.id()))
                    {
                        return Err(StoreError::Exists(obj.id().to_string()));
                    }
                    let name = obj.meta().annotations.name.as_str();
                    if !name.is_empty() {
                        if claimed_names.contains(&(kind, name)) {
                            return Err(StoreError::NameConflict(name.to_string()));
                        }
                        if let Some(existing) = state.id_by_name(kind, name) {
                            if existing != obj.id() && !deleted.contains(&(kind, existing.as_str()))
                            {
                                return Err(StoreError::NameConflict(name.to_string()));
                            }
                        }
                        claimed_names.insert((kind, name));
                    }
                    if let Object::Resource(res) = obj {
                        if state.id_by_name(Kind::Extension, &res.kind).is_none() {
                            return Err(StoreError::InvalidArgument(format!(
                                "unknown extension kind: {}",
                                res.kind
                            )));
                        }
                    }
                }
                StoreAction::Update(obj) => {
                    let current = state
                        .get_object(obj.kind(), obj.id())
                        .ok_or_else(|| StoreError::NotFound(obj.id().to_string()))?;
                    if current.meta().version != obj.meta().version {
                        return Err(StoreError::StaleVersion {
                            id: obj.id().to_string(),
                            have: obj.meta().version,
                            stored: current.meta().version,
                        });
                    }
                }
                StoreAction::Delete { kind, id } => {
                    if state.get_object(*kind, id).is_none() {
                        return Err(StoreError::NotFound(id.clone()));
                    }
                    deleted.insert((*kind, id.as_str()));
                }
            }
        }
        Ok(())
    }

    /// Apply a foreign committed batch, tolerating rejection.
    ///
    /// The Raft apply loop uses this for entries proposed elsewhere: a
    /// batch that fails validation was rejected identically on every
    /// member, so it is logged and skipped rather than surfaced.
    pub fn apply_committed(&self, actions: &[StoreAction]) {
        if let Err(err) = self.apply_actions(actions) {
            warn!(error = %err, count = actions.len(), "committed batch rejected");
        }
    }

    /// Subscribe to all committed events.
    pub fn watch(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Subscribe with a predicate.
    pub fn watch_where(
        &self,
        predicate: impl Fn(&StoreEvent) -> bool + Send + 'static,
    ) -> EventStream {
        self.bus.subscribe_where(predicate)
    }

    /// Split a large set of staged writes into bounded transactions.
    ///
    /// Each closure invocation stages at most `limit` actions; batches
    /// commit independently, so partial failure leaves earlier batches
    /// applied.
    pub async fn batch<I, F>(&self, limit: usize, items: I, mut f: F) -> StoreResult<usize>
    where
        I: IntoIterator,
        F: FnMut(&mut WriteTx<'_>, I::Item) -> StoreResult<()>,
    {
        let mut committed = 0;
        let mut pending: Vec<I::Item> = Vec::new();
        for item in items {
            pending.push(item);
            if pending.len() >= limit {
                committed += self.flush_batch(&mut pending, &mut f).await?;
            }
        }
        if !pending.is_empty() {
            committed += self.flush_batch(&mut pending, &mut f).await?;
        }
        Ok(committed)
    }

    async fn flush_batch<T, F>(&self, pending: &mut Vec<T>, f: &mut F) -> StoreResult<usize>
    where
        F: FnMut(&mut WriteTx<'_>, T) -> StoreResult<()>,
    {
        let count = pending.len();
        let items: Vec<T> = pending.drain(..).collect();
        self.update(|tx| {
            for item in items {
                f(tx, item)?;
            }
            Ok(())
        })
        .await?;
        debug!(count, "batch committed");
        Ok(count)
    }
}
