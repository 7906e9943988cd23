//! Per-kind object tables with primary and secondary indexes.
//!
//! Every kind gets a primary `id` tree and a unique `name` tree; kinds
//! that declare [`StoreObject::index_keys`] additionally get secondary
//! trees keyed by `(value, id)` so equality lookups are range scans.
//! Label entries are indexed for every kind, which is what backs the
//! custom label-selector lookups used by extension resources.

use std::collections::BTreeMap;

use crate::object::{idx, StoreObject};
use crate::objects::{NodeMembership, NodeRole, ObjectId, TaskState};

/// Query selector for `find` operations.
///
/// Filters double as predicates: the indexed fast path serves committed
/// state, while [`Filter::matches`] serves transaction overlays and event
/// subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    ByIdPrefix(String),
    ByName(String),
    ByNamePrefix(String),
    /// Tasks of one service.
    ByService(String),
    /// Tasks assigned to one node.
    ByNode(String),
    /// Tasks of one service slot.
    BySlot { service_id: String, slot: u64 },
    ByDesiredState(TaskState),
    ByRole(NodeRole),
    ByMembership(NodeMembership),
    /// Resources of one registered extension kind.
    ByResourceKind(String),
    /// Objects carrying a given annotation label.
    ByLabel { key: String, value: String },
}

impl Filter {
    /// Secondary index this filter can be served from, with the key prefix
    /// to scan. `None` means primary-index or full-scan evaluation.
    fn index_scan(&self) -> Option<(&'static str, String)> {
        match self {
            Filter::ByService(id) => Some((idx::SERVICE, id.clone())),
            Filter::ByNode(id) => Some((idx::NODE, id.clone())),
            Filter::BySlot { service_id, slot } => {
                Some((idx::SLOT, format!("{service_id}/{slot}")))
            }
            Filter::ByDesiredState(state) => {
                Some((idx::DESIRED_STATE, state.as_str().to_string()))
            }
            Filter::ByRole(role) => Some((idx::ROLE, role.as_str().to_string())),
            Filter::ByMembership(m) => {
                Some((idx::MEMBERSHIP, format!("{m:?}").to_lowercase()))
            }
            Filter::ByResourceKind(kind) => Some((idx::RESOURCE_KIND, kind.clone())),
            Filter::ByLabel { key, value } => Some((idx::LABEL, format!("{key}={value}"))),
            _ => None,
        }
    }

    /// Direct predicate evaluation against a single object.
    pub fn matches<T: StoreObject>(&self, obj: &T) -> bool {
        match self {
            Filter::All => true,
            Filter::ByIdPrefix(prefix) => obj.id().starts_with(prefix.as_str()),
            Filter::ByName(name) => obj.name() == name,
            Filter::ByNamePrefix(prefix) => obj.name().starts_with(prefix.as_str()),
            Filter::ByLabel { key, value } => obj
                .meta()
                .annotations
                .labels
                .get(key)
                .is_some_and(|v| v == value),
            _ => match self.index_scan() {
                Some((index, key)) => obj
                    .index_keys()
                    .iter()
                    .any(|(name, value)| *name == index && *value == key),
                None => false,
            },
        }
    }
}

/// Indexed storage for one object kind.
#[derive(Debug, Clone)]
pub struct ObjectTable<T: StoreObject> {
    objects: BTreeMap<ObjectId, T>,
    /// name → id; enforces name uniqueness within the kind.
    names: BTreeMap<String, ObjectId>,
    /// (index, "value\x00id") → id.
    secondary: BTreeMap<(&'static str, String), ObjectId>,
}

impl<T: StoreObject> Default for ObjectTable<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            names: BTreeMap::new(),
            secondary: BTreeMap::new(),
        }
    }
}

/// Separator between an index value and the object id in composite keys.
/// NUL cannot appear in ids or index values.
const KEY_SEP: char = '\x00';

impl<T: StoreObject> ObjectTable<T> {
    pub fn get(&self, id: &str) -> Option<&T> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Id registered under a name, if any.
    pub fn id_by_name(&self, name: &str) -> Option<&ObjectId> {
        self.names.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.objects.values()
    }

    /// Insert or replace, maintaining all indexes.
    pub fn put(&mut self, obj: T) {
        let old = self.objects.get(obj.id()).cloned();
        if let Some(old) = old {
            self.unindex(&old);
        }
        self.index(&obj);
        self.objects.insert(obj.id().to_string(), obj);
    }

    /// Remove by id, returning the stored object.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let obj = self.objects.remove(id)?;
        self.unindex(&obj);
        Some(obj)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.names.clear();
        self.secondary.clear();
    }

    /// All objects matching the filter, in id order.
    pub fn find(&self, filter: &Filter) -> Vec<T> {
        match filter {
            Filter::All => self.objects.values().cloned().collect(),
            Filter::ByIdPrefix(prefix) => self
                .objects
                .range(prefix.clone()..)
                .take_while(|(id, _)| id.starts_with(prefix.as_str()))
                .map(|(_, obj)| obj.clone())
                .collect(),
            Filter::ByName(name) => self
                .names
                .get(name)
                .and_then(|id| self.objects.get(id))
                .cloned()
                .into_iter()
                .collect(),
            Filter::ByNamePrefix(prefix) => {
                let mut out: Vec<T> = self
                    .names
                    .range(prefix.clone()..)
                    .take_while(|(name, _)| name.starts_with(prefix.as_str()))
                    .filter_map(|(_, id)| self.objects.get(id))
                    .cloned()
                    .collect();
                out.sort_by(|a, b| a.id().cmp(b.id()));
                out
            }
            _ => match filter.index_scan() {
                Some((index, value)) => {
                    let prefix = format!("{value}{KEY_SEP}");
                    let start = (index, prefix.clone());
                    self.secondary
                        .range(start..)
                        .take_while(|((name, key), _)| {
                            *name == index && key.starts_with(prefix.as_str())
                        })
                        .filter_map(|(_, id)| self.objects.get(id))
                        .cloned()
                        .collect()
                }
                // No index can serve this filter for this kind; scan.
                None => self
                    .objects
                    .values()
                    .filter(|obj| filter.matches(*obj))
                    .cloned()
                    .collect(),
            },
        }
    }

    fn index(&mut self, obj: &T) {
        let id = obj.id().to_string();
        if !obj.name().is_empty() {
            self.names.insert(obj.name().to_string(), id.clone());
        }
        for (index, value) in self.entries(obj) {
            self.secondary.insert((index, value), id.clone());
        }
    }

    fn unindex(&mut self, obj: &T) {
        if !obj.name().is_empty() {
            // Only drop the name entry if it still points at this object.
            if self.names.get(obj.name()).map(String::as_str) == Some(obj.id()) {
                self.names.remove(obj.name());
            }
        }
        for entry in self.entries(obj) {
            self.secondary.remove(&entry);
        }
    }

    fn entries(&self, obj: &T) -> Vec<(&'static str, String)> {
        let mut entries: Vec<(&'static str, String)> = obj
            .index_keys()
            .into_iter()
            .map(|(index, value)| (index, format!("{value}{KEY_SEP}{}", obj.id())))
            .collect();
        for (k, v) in &obj.meta().annotations.labels {
            entries.push((idx::LABEL, format!("{k}={v}{KEY_SEP}{}", obj.id())));
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Annotations, Meta, Service, ServiceSpec, Task, TaskSpec, TaskStatus};

    fn service(id: &str, name: &str) -> Service {
        Service {
            id: id.into(),
            meta: Meta {
                annotations: Annotations::named(name),
                ..Meta::default()
            },
            spec: ServiceSpec::default(),
            endpoint: None,
        }
    }

    fn task(id: &str, service: &str, slot: u64, node: Option<&str>) -> Task {
        Task {
            id: id.into(),
            meta: Meta::default(),
            service_id: service.into(),
            slot,
            node_id: node.map(String::from),
            spec: TaskSpec::default(),
            spec_version: 0,
            desired_state: TaskState::Running,
            status: TaskStatus::default(),
            networks: Vec::new(),
            endpoint: None,
        }
    }

    #[test]
    fn put_get_remove() {
        let mut table = ObjectTable::default();
        table.put(service("s1", "web"));

        assert!(table.contains("s1"));
        assert_eq!(table.get("s1").unwrap().meta.annotations.name, "web");
        assert_eq!(table.id_by_name("web"), Some(&"s1".to_string()));

        let removed = table.remove("s1").unwrap();
        assert_eq!(removed.id, "s1");
        assert!(table.id_by_name("web").is_none());
    }

    #[test]
    fn name_index_follows_rename() {
        let mut table = ObjectTable::default();
        table.put(service("s1", "web"));

        let mut renamed = service("s1", "api");
        renamed.meta.version = 1;
        table.put(renamed);

        assert!(table.id_by_name("web").is_none());
        assert_eq!(table.id_by_name("api"), Some(&"s1".to_string()));
    }

    #[test]
    fn find_by_service_and_node() {
        let mut table = ObjectTable::default();
        table.put(task("t1", "s1", 1, Some("n1")));
        table.put(task("t2", "s1", 2, Some("n2")));
        table.put(task("t3", "s2", 1, Some("n1")));

        let by_service = table.find(&Filter::ByService("s1".into()));
        assert_eq!(
            by_service.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );

        let by_node = table.find(&Filter::ByNode("n1".into()));
        assert_eq!(
            by_node.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t3"]
        );
    }

    #[test]
    fn find_by_slot_is_exact() {
        let mut table = ObjectTable::default();
        table.put(task("t1", "s1", 1, None));
        table.put(task("t2", "s1", 11, None));

        let slot1 = table.find(&Filter::BySlot {
            service_id: "s1".into(),
            slot: 1,
        });
        assert_eq!(slot1.len(), 1);
        assert_eq!(slot1[0].id, "t1");
    }

    #[test]
    fn secondary_index_follows_update() {
        let mut table = ObjectTable::default();
        table.put(task("t1", "s1", 1, None));
        assert!(table.find(&Filter::ByNode("n1".into())).is_empty());

        table.put(task("t1", "s1", 1, Some("n1")));
        assert_eq!(table.find(&Filter::ByNode("n1".into())).len(), 1);

        table.put(task("t1", "s1", 1, Some("n2")));
        assert!(table.find(&Filter::ByNode("n1".into())).is_empty());
        assert_eq!(table.find(&Filter::ByNode("n2".into())).len(), 1);
    }

    #[test]
    fn id_and_name_prefix_scans() {
        let mut table = ObjectTable::default();
        table.put(service("abc123", "web-front"));
        table.put(service("abd456", "web-back"));
        table.put(service("zzz789", "db"));

        assert_eq!(table.find(&Filter::ByIdPrefix("ab".into())).len(), 2);
        assert_eq!(table.find(&Filter::ByIdPrefix("abc".into())).len(), 1);
        assert_eq!(table.find(&Filter::ByNamePrefix("web-".into())).len(), 2);
        assert!(table.find(&Filter::ByNamePrefix("x".into())).is_empty());
    }

    #[test]
    fn label_index() {
        let mut table = ObjectTable::default();
        let mut svc = service("s1", "web");
        svc.meta
            .annotations
            .labels
            .insert("tier".into(), "frontend".into());
        table.put(svc);
        table.put(service("s2", "db"));

        let hits = table.find(&Filter::ByLabel {
            key: "tier".into(),
            value: "frontend".into(),
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
    }

    #[test]
    fn filter_matches_mirrors_index_lookup() {
        let t = task("t1", "s1", 3, Some("n9"));
        assert!(Filter::ByService("s1".into()).matches(&t));
        assert!(Filter::ByNode("n9".into()).matches(&t));
        assert!(Filter::BySlot {
            service_id: "s1".into(),
            slot: 3
        }
        .matches(&t));
        assert!(!Filter::ByService("s2".into()).matches(&t));
        assert!(Filter::ByDesiredState(TaskState::Running).matches(&t));
    }
}
