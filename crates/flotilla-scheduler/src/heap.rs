//! Node heap ordered by assigned-task count, with an id index.
//!
//! A plain binary heap cannot update a key in place, so this keeps the
//! heap array alongside a node-id → position map and re-establishes the
//! heap property after each mutation. `find_min` first tries a pruned
//! search down the heap (the root is usually feasible); callers whose
//! constraints are known to exclude most nodes ask for a full scan.

use std::collections::HashMap;

use flotilla_store::{Node, NodeResources};

/// A node tracked by the scheduler, with its current commitments.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: Node,
    /// Non-terminal tasks assigned to this node.
    pub task_count: usize,
    /// Sum of resource reservations of those tasks.
    pub reserved: NodeResources,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            task_count: 0,
            reserved: NodeResources::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    /// Resources still available under the node's advertised capacity.
    pub fn available(&self) -> NodeResources {
        let capacity = self
            .node
            .description
            .as_ref()
            .map(|d| d.resources)
            .unwrap_or_default();
        NodeResources {
            nano_cpus: capacity.nano_cpus.saturating_sub(self.reserved.nano_cpus),
            memory_bytes: capacity
                .memory_bytes
                .saturating_sub(self.reserved.memory_bytes),
        }
    }
}

/// Min-heap over [`NodeInfo`] keyed by task count.
#[derive(Debug, Default)]
pub struct NodeHeap {
    heap: Vec<NodeInfo>,
    /// node id → heap position.
    index: HashMap<String, usize>,
}

impl NodeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeInfo> {
        self.index.get(node_id).map(|&pos| &self.heap[pos])
    }

    /// Least-loaded node, if any.
    pub fn peek(&self) -> Option<&NodeInfo> {
        self.heap.first()
    }

    /// Insert a node or replace its entry, restoring heap order.
    pub fn put(&mut self, info: NodeInfo) {
        match self.index.get(info.id()).copied() {
            Some(pos) => {
                self.heap[pos] = info;
                self.fix(pos);
            }
            None => {
                let pos = self.heap.len();
                self.index.insert(info.id().to_string(), pos);
                self.heap.push(info);
                self.sift_up(pos);
            }
        }
    }

    /// Remove a node from consideration.
    pub fn remove(&mut self, node_id: &str) -> Option<NodeInfo> {
        let pos = self.index.remove(node_id)?;
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        let removed = self.heap.pop().expect("non-empty after index hit");
        if pos < self.heap.len() {
            self.index.insert(self.heap[pos].id().to_string(), pos);
            self.fix(pos);
        }
        Some(removed)
    }

    /// Adjust one node's task count in place.
    pub fn update_count(&mut self, node_id: &str, task_count: usize, reserved: NodeResources) {
        if let Some(&pos) = self.index.get(node_id) {
            self.heap[pos].task_count = task_count;
            self.heap[pos].reserved = reserved;
            self.fix(pos);
        }
    }

    /// Find the feasible node with the fewest tasks.
    ///
    /// With `scan_all` false the search walks the heap and prunes on the
    /// heap property; pass true when the constraints are selective enough
    /// that the cheapest feasible node is unlikely to sit near the root.
    pub fn find_min(
        &self,
        feasible: impl Fn(&NodeInfo) -> bool,
        scan_all: bool,
    ) -> Option<&NodeInfo> {
        if self.heap.is_empty() {
            return None;
        }
        if scan_all {
            return self
                .heap
                .iter()
                .filter(|info| feasible(info))
                .min_by_key(|info| info.task_count);
        }
        self.search(0, &feasible)
    }

    /// All node ids currently tracked.
    pub fn node_ids(&self) -> Vec<String> {
        self.heap.iter().map(|info| info.id().to_string()).collect()
    }

    fn search(
        &self,
        pos: usize,
        feasible: &impl Fn(&NodeInfo) -> bool,
    ) -> Option<&NodeInfo> {
        if pos >= self.heap.len() {
            return None;
        }
        let entry = &self.heap[pos];
        if feasible(entry) {
            // Heap property: nothing below can have fewer tasks.
            return Some(entry);
        }
        let left = self.search(pos * 2 + 1, feasible);
        let right = self.search(pos * 2 + 2, feasible);
        match (left, right) {
            (Some(l), Some(r)) => Some(if l.task_count <= r.task_count { l } else { r }),
            (Some(l), None) => Some(l),
            (None, r) => r,
        }
    }

    fn fix(&mut self, pos: usize) {
        let pos = self.sift_up(pos);
        self.sift_down(pos);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].task_count >= self.heap[parent].task_count {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = pos * 2 + 1;
            let right = pos * 2 + 2;
            let mut smallest = pos;
            if left < self.heap.len()
                && self.heap[left].task_count < self.heap[smallest].task_count
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.heap[right].task_count < self.heap[smallest].task_count
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id().to_string(), a);
        self.index.insert(self.heap[b].id().to_string(), b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{
        Meta, NodeCertificate, NodeRole, NodeSpec, NodeStatus,
    };

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            meta: Meta::default(),
            role: NodeRole::Worker,
            spec: NodeSpec::default(),
            description: None,
            status: NodeStatus::default(),
            certificate: NodeCertificate::default(),
            manager: None,
        }
    }

    fn info(id: &str, tasks: usize) -> NodeInfo {
        let mut info = NodeInfo::new(node(id));
        info.task_count = tasks;
        info
    }

    #[test]
    fn peek_returns_least_loaded() {
        let mut heap = NodeHeap::new();
        heap.put(info("n1", 5));
        heap.put(info("n2", 1));
        heap.put(info("n3", 3));

        assert_eq!(heap.peek().unwrap().id(), "n2");
        assert_eq!(heap.len(), 3);
    }

    #[test]
    fn update_count_reorders() {
        let mut heap = NodeHeap::new();
        heap.put(info("n1", 0));
        heap.put(info("n2", 2));
        assert_eq!(heap.peek().unwrap().id(), "n1");

        heap.update_count("n1", 7, NodeResources::default());
        assert_eq!(heap.peek().unwrap().id(), "n2");

        heap.update_count("n1", 1, NodeResources::default());
        assert_eq!(heap.peek().unwrap().id(), "n1");
    }

    #[test]
    fn remove_keeps_heap_consistent() {
        let mut heap = NodeHeap::new();
        for (id, tasks) in [("n1", 4), ("n2", 1), ("n3", 2), ("n4", 9)] {
            heap.put(info(id, tasks));
        }

        let removed = heap.remove("n2").unwrap();
        assert_eq!(removed.id(), "n2");
        assert_eq!(heap.peek().unwrap().id(), "n3");
        assert!(heap.get("n2").is_none());
        assert_eq!(heap.len(), 3);

        assert!(heap.remove("n2").is_none());
    }

    #[test]
    fn find_min_prefers_root_when_feasible() {
        let mut heap = NodeHeap::new();
        heap.put(info("n1", 0));
        heap.put(info("n2", 3));

        let best = heap.find_min(|_| true, false).unwrap();
        assert_eq!(best.id(), "n1");
    }

    #[test]
    fn find_min_skips_infeasible_root() {
        let mut heap = NodeHeap::new();
        heap.put(info("n1", 0));
        heap.put(info("n2", 3));
        heap.put(info("n3", 5));

        let best = heap.find_min(|n| n.id() != "n1", false).unwrap();
        assert_eq!(best.id(), "n2");
    }

    #[test]
    fn find_min_scan_all_matches_heap_search() {
        let mut heap = NodeHeap::new();
        for (id, tasks) in [("n1", 6), ("n2", 2), ("n3", 4), ("n4", 8), ("n5", 0)] {
            heap.put(info(id, tasks));
        }
        let feasible = |n: &NodeInfo| n.task_count >= 3;

        let heap_pick = heap.find_min(feasible, false).unwrap().id().to_string();
        let scan_pick = heap.find_min(feasible, true).unwrap().id().to_string();
        assert_eq!(heap_pick, scan_pick);
        assert_eq!(heap_pick, "n3");
    }

    #[test]
    fn find_min_none_when_nothing_feasible() {
        let mut heap = NodeHeap::new();
        heap.put(info("n1", 0));
        assert!(heap.find_min(|_| false, false).is_none());
        assert!(heap.find_min(|_| false, true).is_none());
    }

    #[test]
    fn available_subtracts_reservations() {
        let mut n = node("n1");
        n.description = Some(flotilla_store::NodeDescription {
            hostname: "host1".into(),
            platform: flotilla_store::Platform::default(),
            resources: NodeResources {
                nano_cpus: 4_000_000_000,
                memory_bytes: 8 << 30,
            },
            engine: Default::default(),
        });
        let mut info = NodeInfo::new(n);
        info.reserved = NodeResources {
            nano_cpus: 1_000_000_000,
            memory_bytes: 2 << 30,
        };

        let avail = info.available();
        assert_eq!(avail.nano_cpus, 3_000_000_000);
        assert_eq!(avail.memory_bytes, 6 << 30);
    }
}
