//! Weighted manager selection.
//!
//! The agent learns the manager set from session messages and picks a
//! manager with weight-proportional probability. Connection failures
//! halve the failed manager's weight so the picker drifts toward
//! responsive managers without ever pinning to one.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

const MIN_WEIGHT: i32 = 1;
const DEFAULT_WEIGHT: i32 = 8;

/// Observed manager addresses with selection weights.
#[derive(Debug, Default)]
pub struct ManagerSet {
    peers: Mutex<BTreeMap<String, i32>>,
}

impl ManagerSet {
    pub fn new(seed: impl IntoIterator<Item = String>) -> Self {
        let peers = seed
            .into_iter()
            .map(|addr| (addr, DEFAULT_WEIGHT))
            .collect();
        Self {
            peers: Mutex::new(peers),
        }
    }

    /// Record a manager advertised by the cluster. Known addresses keep
    /// their learned weight unless the broadcast carries a higher one.
    pub fn observe(&self, addr: &str, weight: i32) {
        let mut peers = self.peers.lock().unwrap();
        let weight = weight.max(MIN_WEIGHT);
        peers
            .entry(addr.to_string())
            .and_modify(|w| *w = (*w).max(weight))
            .or_insert(weight);
    }

    /// Halve the weight of a manager that failed us.
    pub fn observe_failure(&self, addr: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(weight) = peers.get_mut(addr) {
            *weight = (*weight / 2).max(MIN_WEIGHT);
            debug!(addr, weight = *weight, "manager weight reduced");
        }
    }

    /// Weight-proportional random pick.
    pub fn pick(&self) -> AgentResult<String> {
        let peers = self.peers.lock().unwrap();
        let total: i64 = peers.values().map(|w| *w as i64).sum();
        if total <= 0 || peers.is_empty() {
            return Err(AgentError::NoManagers);
        }

        let mut roll = rand::thread_rng().gen_range(0..total);
        for (addr, weight) in peers.iter() {
            roll -= *weight as i64;
            if roll < 0 {
                return Ok(addr.clone());
            }
        }
        // Unreachable with total > 0; satisfy the checker.
        Err(AgentError::NoManagers)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addrs(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_cannot_pick() {
        let set = ManagerSet::default();
        assert!(matches!(set.pick(), Err(AgentError::NoManagers)));
    }

    #[test]
    fn single_manager_always_picked() {
        let set = ManagerSet::new(["10.0.0.1:2377".to_string()]);
        for _ in 0..10 {
            assert_eq!(set.pick().unwrap(), "10.0.0.1:2377");
        }
    }

    #[test]
    fn observe_adds_and_keeps_learned_weight() {
        let set = ManagerSet::default();
        set.observe("m1:2377", 4);
        set.observe("m2:2377", 4);
        assert_eq!(set.len(), 2);

        // A lower advertised weight does not clobber a learned one.
        set.observe("m1:2377", 1);
        set.observe_failure("m2:2377");
        set.observe("m2:2377", 2);

        let addrs = set.addrs();
        assert!(addrs.contains(&"m1:2377".to_string()));
        assert!(addrs.contains(&"m2:2377".to_string()));
    }

    #[test]
    fn failures_bias_away_but_never_exclude() {
        let set = ManagerSet::new(["m1".to_string(), "m2".to_string()]);
        for _ in 0..16 {
            set.observe_failure("m1");
        }

        // m1 can still be picked (weight floor), but m2 dominates.
        let mut m2_hits = 0;
        for _ in 0..200 {
            if set.pick().unwrap() == "m2" {
                m2_hits += 1;
            }
        }
        assert!(m2_hits > 120, "expected m2 to dominate, got {m2_hits}/200");
    }
}
