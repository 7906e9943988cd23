//! The closed set of storable kinds and the per-kind object interface.
//!
//! `Kind` + `Object` are the tagged variants that cross the Raft log and
//! the event bus; [`StoreObject`] is the static interface the generic
//! tables and transactions are written against.

use serde::{Deserialize, Serialize};

use crate::objects::*;

/// Secondary index names. Index keys are `(&'static str, String)` pairs
/// produced by [`StoreObject::index_keys`].
pub mod idx {
    pub const SERVICE: &str = "service";
    pub const NODE: &str = "node";
    pub const SLOT: &str = "slot";
    pub const DESIRED_STATE: &str = "desired_state";
    pub const ROLE: &str = "role";
    pub const MEMBERSHIP: &str = "membership";
    pub const RESOURCE_KIND: &str = "resource_kind";
    pub const LABEL: &str = "label";
}

/// Every storable entity kind, closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Cluster,
    Node,
    Service,
    Task,
    Network,
    Volume,
    Resource,
    Extension,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Cluster,
        Kind::Node,
        Kind::Service,
        Kind::Task,
        Kind::Network,
        Kind::Volume,
        Kind::Resource,
        Kind::Extension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Cluster => "cluster",
            Kind::Node => "node",
            Kind::Service => "service",
            Kind::Task => "task",
            Kind::Network => "network",
            Kind::Volume => "volume",
            Kind::Resource => "resource",
            Kind::Extension => "extension",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object of any kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Object {
    Cluster(Cluster),
    Node(Node),
    Service(Service),
    Task(Task),
    Network(Network),
    Volume(Volume),
    Resource(Resource),
    Extension(Extension),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Cluster(_) => Kind::Cluster,
            Object::Node(_) => Kind::Node,
            Object::Service(_) => Kind::Service,
            Object::Task(_) => Kind::Task,
            Object::Network(_) => Kind::Network,
            Object::Volume(_) => Kind::Volume,
            Object::Resource(_) => Kind::Resource,
            Object::Extension(_) => Kind::Extension,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Object::Cluster(o) => &o.id,
            Object::Node(o) => &o.id,
            Object::Service(o) => &o.id,
            Object::Task(o) => &o.id,
            Object::Network(o) => &o.id,
            Object::Volume(o) => &o.id,
            Object::Resource(o) => &o.id,
            Object::Extension(o) => &o.id,
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Object::Cluster(o) => &o.meta,
            Object::Node(o) => &o.meta,
            Object::Service(o) => &o.meta,
            Object::Task(o) => &o.meta,
            Object::Network(o) => &o.meta,
            Object::Volume(o) => &o.meta,
            Object::Resource(o) => &o.meta,
            Object::Extension(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Object::Cluster(o) => &mut o.meta,
            Object::Node(o) => &mut o.meta,
            Object::Service(o) => &mut o.meta,
            Object::Task(o) => &mut o.meta,
            Object::Network(o) => &mut o.meta,
            Object::Volume(o) => &mut o.meta,
            Object::Resource(o) => &mut o.meta,
            Object::Extension(o) => &mut o.meta,
        }
    }
}

/// One typed mutation; the unit of a Raft proposal batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreAction {
    Create(Object),
    Update(Object),
    Delete { kind: Kind, id: ObjectId },
}

impl StoreAction {
    pub fn kind(&self) -> Kind {
        match self {
            StoreAction::Create(o) | StoreAction::Update(o) => o.kind(),
            StoreAction::Delete { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            StoreAction::Create(o) | StoreAction::Update(o) => o.id(),
            StoreAction::Delete { id, .. } => id,
        }
    }
}

/// Static interface implemented by every storable type.
pub trait StoreObject: Clone + Sized + Send + 'static {
    const KIND: Kind;

    fn id(&self) -> &str;
    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    /// Secondary index entries for this object. Label entries are added
    /// automatically by the table.
    fn index_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn into_object(self) -> Object;
    fn from_object(obj: Object) -> Option<Self>;

    fn name(&self) -> &str {
        &self.meta().annotations.name
    }
}

macro_rules! store_object {
    ($ty:ident, $kind:expr) => {
        impl StoreObject for $ty {
            const KIND: Kind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn meta(&self) -> &Meta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut Meta {
                &mut self.meta
            }

            fn into_object(self) -> Object {
                Object::$ty(self)
            }

            fn from_object(obj: Object) -> Option<Self> {
                match obj {
                    Object::$ty(o) => Some(o),
                    _ => None,
                }
            }
        }
    };
}

store_object!(Cluster, Kind::Cluster);
store_object!(Service, Kind::Service);
store_object!(Network, Kind::Network);
store_object!(Volume, Kind::Volume);
store_object!(Extension, Kind::Extension);

impl StoreObject for Node {
    const KIND: Kind = Kind::Node;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        vec![
            (idx::ROLE, self.role.as_str().to_string()),
            (
                idx::MEMBERSHIP,
                format!("{:?}", self.spec.membership).to_lowercase(),
            ),
        ]
    }

    fn into_object(self) -> Object {
        Object::Node(self)
    }

    fn from_object(obj: Object) -> Option<Self> {
        match obj {
            Object::Node(o) => Some(o),
            _ => None,
        }
    }

    // Nodes are commonly addressed by hostname rather than annotation name.
    fn name(&self) -> &str {
        if self.meta.annotations.name.is_empty() {
            self.description
                .as_ref()
                .map(|d| d.hostname.as_str())
                .unwrap_or("")
        } else {
            &self.meta.annotations.name
        }
    }
}

impl StoreObject for Task {
    const KIND: Kind = Kind::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        let mut keys = vec![
            (idx::SERVICE, self.service_id.clone()),
            (idx::SLOT, format!("{}/{}", self.service_id, self.slot)),
            (idx::DESIRED_STATE, self.desired_state.as_str().to_string()),
        ];
        if let Some(node) = &self.node_id {
            keys.push((idx::NODE, node.clone()));
        }
        keys
    }

    fn into_object(self) -> Object {
        Object::Task(self)
    }

    fn from_object(obj: Object) -> Option<Self> {
        match obj {
            Object::Task(o) => Some(o),
            _ => None,
        }
    }

    // Tasks have no unique name; slot identity lives in its own index.
    fn name(&self) -> &str {
        ""
    }
}

impl StoreObject for Resource {
    const KIND: Kind = Kind::Resource;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        vec![(idx::RESOURCE_KIND, self.kind.clone())]
    }

    fn into_object(self) -> Object {
        Object::Resource(self)
    }

    fn from_object(obj: Object) -> Option<Self> {
        match obj {
            Object::Resource(o) => Some(o),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Meta, Task, TaskSpec, TaskState, TaskStatus};

    fn sample_task() -> Task {
        Task {
            id: "t1".into(),
            meta: Meta::default(),
            service_id: "svc1".into(),
            slot: 2,
            node_id: Some("n1".into()),
            spec: TaskSpec::default(),
            spec_version: 0,
            desired_state: TaskState::Running,
            status: TaskStatus::default(),
            networks: Vec::new(),
            endpoint: None,
        }
    }

    #[test]
    fn task_index_keys() {
        let task = sample_task();
        let keys = task.index_keys();
        assert!(keys.contains(&(idx::SERVICE, "svc1".to_string())));
        assert!(keys.contains(&(idx::SLOT, "svc1/2".to_string())));
        assert!(keys.contains(&(idx::NODE, "n1".to_string())));
        assert!(keys.contains(&(idx::DESIRED_STATE, "running".to_string())));
    }

    #[test]
    fn unassigned_task_has_no_node_key() {
        let mut task = sample_task();
        task.node_id = None;
        assert!(!task.index_keys().iter().any(|(name, _)| *name == idx::NODE));
    }

    #[test]
    fn action_roundtrips_through_json() {
        let action = StoreAction::Create(sample_task().into_object());
        let json = serde_json::to_vec(&action).unwrap();
        let back: StoreAction = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, action);
        assert_eq!(back.kind(), Kind::Task);
        assert_eq!(back.id(), "t1");
    }

    #[test]
    fn delete_action_carries_kind_and_id() {
        let action = StoreAction::Delete {
            kind: Kind::Service,
            id: "svc1".into(),
        };
        assert_eq!(action.kind(), Kind::Service);
        assert_eq!(action.id(), "svc1");
    }
}
