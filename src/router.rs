//! Sticky router: consistent-hash ring plus a user -> worker assignment cache.
//!
//! Structurally this is the teacher's `ConsistentHashPolicy` generalized from
//! "pick a worker URL for an HTTP request" to "pick a worker id for a user id,
//! and remember the decision" — the assignment cache is new relative to the
//! teacher, since the teacher's policy recomputes the ring lookup on every
//! call instead of caching per-key decisions.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{PoolError, PoolResult};
use crate::hash_ring::HashRing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub worker_id: String,
    pub user_id: String,
    pub hash_value: u32,
    pub is_new_assignment: bool,
}

/// Serializable snapshot of router state, for export/import round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterState {
    pub workers: Vec<String>,
    pub assignments: Vec<(String, String)>,
    pub virtual_nodes: u32,
}

struct Inner {
    ring: HashRing,
    workers: HashSet<String>,
    cache: HashMap<String, String>,
}

/// Sticky router. Cheap to clone via `Arc` at the call site; internally
/// guarded by a single `RwLock` since ring mutation (add/remove worker) is
/// rare relative to routing lookups.
pub struct StickyRouter {
    inner: RwLock<Inner>,
}

impl StickyRouter {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ring: HashRing::new(virtual_nodes),
                workers: HashSet::new(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Idempotent. Does not invalidate existing cached assignments — stickiness
    /// wins over rebalance.
    pub fn add_worker(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        inner.workers.insert(worker_id.to_string());
        inner.ring.add_worker(worker_id);
    }

    /// Idempotent. Drops every cache entry that pointed at this worker.
    pub fn remove_worker(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        inner.workers.remove(worker_id);
        inner.ring.remove_worker(worker_id);
        inner.cache.retain(|_, w| w != worker_id);
    }

    pub fn route(&self, user_id: &str) -> PoolResult<RouteDecision> {
        let mut inner = self.inner.write();

        if let Some(cached) = inner.cache.get(user_id) {
            if inner.workers.contains(cached) {
                let worker_id = cached.clone();
                let hash_value = crate::hash_ring::fnv1a(user_id);
                return Ok(RouteDecision {
                    worker_id,
                    user_id: user_id.to_string(),
                    hash_value,
                    is_new_assignment: false,
                });
            }
        }

        let hash_value = crate::hash_ring::fnv1a(user_id);
        let worker_id = inner
            .ring
            .lookup(hash_value)
            .ok_or(PoolError::NoWorkersAvailable)?
            .to_string();
        inner.cache.insert(user_id.to_string(), worker_id.clone());

        Ok(RouteDecision {
            worker_id,
            user_id: user_id.to_string(),
            hash_value,
            is_new_assignment: true,
        })
    }

    /// Non-caching ring lookup. Never reads or writes the assignment cache.
    pub fn peek(&self, user_id: &str) -> Option<String> {
        let inner = self.inner.read();
        inner.ring.lookup_key(user_id).map(str::to_string)
    }

    /// Installs a cache entry bypassing the ring. Fails if `worker_id` is not registered.
    pub fn force_assign(&self, user_id: &str, worker_id: &str) -> PoolResult<()> {
        let mut inner = self.inner.write();
        if !inner.workers.contains(worker_id) {
            return Err(PoolError::UnknownWorker(worker_id.to_string()));
        }
        inner.cache.insert(user_id.to_string(), worker_id.to_string());
        Ok(())
    }

    pub fn clear_assignment(&self, user_id: &str) {
        self.inner.write().cache.remove(user_id);
    }

    pub fn clear_cache(&self) {
        self.inner.write().cache.clear();
    }

    pub fn routing_table_size(&self) -> usize {
        self.inner.read().cache.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.read().workers.len()
    }

    pub fn export_state(&self) -> RouterState {
        let inner = self.inner.read();
        RouterState {
            workers: inner.workers.iter().cloned().collect(),
            assignments: inner
                .cache
                .iter()
                .map(|(u, w)| (u.clone(), w.clone()))
                .collect(),
            virtual_nodes: inner.ring.virtual_nodes(),
        }
    }

    /// Any assignment whose worker is absent from `state.workers` is dropped.
    pub fn from_state(state: RouterState) -> Self {
        let router = Self::new(state.virtual_nodes);
        {
            let mut inner = router.inner.write();
            for worker_id in &state.workers {
                inner.workers.insert(worker_id.clone());
                inner.ring.add_worker(worker_id);
            }
            for (user_id, worker_id) in state.assignments {
                if inner.workers.contains(&worker_id) {
                    inner.cache.insert(user_id, worker_id);
                }
            }
        }
        router
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(workers: &[&str]) -> StickyRouter {
        let router = StickyRouter::new(150);
        for w in workers {
            router.add_worker(w);
        }
        router
    }

    #[test]
    fn stickiness_across_repeated_calls() {
        let router = router_with(&["worker-0", "worker-1", "worker-2"]);
        let first = router.route("user-a").unwrap();
        assert!(first.is_new_assignment);
        for _ in 0..10 {
            let again = router.route("user-a").unwrap();
            assert_eq!(again.worker_id, first.worker_id);
            assert!(!again.is_new_assignment);
        }
    }

    #[test]
    fn ring_consistency_after_add_then_remove() {
        let router = router_with(&["worker-0", "worker-1"]);
        router.route("user-a").unwrap();
        router.add_worker("worker-2");
        router.remove_worker("worker-2");
        assert_eq!(router.worker_count(), 2);
    }

    #[test]
    fn adding_worker_does_not_disturb_existing_assignments() {
        let router = router_with(&["worker-0", "worker-1"]);
        let users: Vec<String> = (0..50).map(|i| format!("user-{i}")).collect();
        let before: Vec<String> = users
            .iter()
            .map(|u| router.route(u).unwrap().worker_id)
            .collect();
        router.add_worker("worker-2");
        for (user, expected) in users.iter().zip(before.iter()) {
            assert_eq!(&router.route(user).unwrap().worker_id, expected);
        }
    }

    #[test]
    fn removing_worker_purges_its_assignments() {
        let router = router_with(&["worker-0", "worker-1", "worker-2"]);
        let users: Vec<String> = (0..200).map(|i| format!("user-{i}")).collect();
        let assigned: Vec<(String, String)> = users
            .iter()
            .map(|u| (u.clone(), router.route(u).unwrap().worker_id))
            .collect();

        let victim = "worker-0";
        let affected: Vec<&str> = assigned
            .iter()
            .filter(|(_, w)| w == victim)
            .map(|(u, _)| u.as_str())
            .collect();
        assert!(!affected.is_empty(), "test setup needs at least one hit");

        router.remove_worker(victim);
        for user in affected {
            let after = router.route(user).unwrap();
            assert_ne!(after.worker_id, victim);
        }
    }

    #[test]
    fn distribution_within_expected_bounds() {
        let router = router_with(&["worker-0", "worker-1", "worker-2", "worker-3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let worker_id = router.route(&format!("user-{i}")).unwrap().worker_id;
            *counts.entry(worker_id).or_insert(0) += 1;
        }
        assert_eq!(counts.values().sum::<usize>(), 1000);
        for count in counts.values() {
            assert!(*count >= 51 && *count <= 499, "count {count} out of bounds");
        }
    }

    #[test]
    fn peek_does_not_mutate_cache() {
        let router = router_with(&["worker-0", "worker-1"]);
        assert_eq!(router.routing_table_size(), 0);
        for i in 0..20 {
            router.peek(&format!("user-{i}"));
        }
        assert_eq!(router.routing_table_size(), 0);
    }

    #[test]
    fn force_assign_rejects_unknown_worker() {
        let router = router_with(&["worker-0"]);
        assert!(matches!(
            router.force_assign("user-a", "worker-9"),
            Err(PoolError::UnknownWorker(_))
        ));
    }

    #[test]
    fn export_import_round_trip() {
        let router = router_with(&["worker-0", "worker-1", "worker-2"]);
        for i in 0..30 {
            router.route(&format!("user-{i}")).unwrap();
        }
        let state = router.export_state();
        let restored = StickyRouter::from_state(state);
        assert_eq!(restored.worker_count(), 3);
        for i in 0..30 {
            let user = format!("user-{i}");
            assert_eq!(
                router.route(&user).unwrap().worker_id,
                restored.route(&user).unwrap().worker_id
            );
        }
    }

    #[test]
    fn import_drops_assignments_for_absent_workers() {
        let state = RouterState {
            workers: vec!["worker-0".to_string()],
            assignments: vec![
                ("user-a".to_string(), "worker-0".to_string()),
                ("user-b".to_string(), "worker-9".to_string()),
            ],
            virtual_nodes: 150,
        };
        let router = StickyRouter::from_state(state);
        assert_eq!(router.routing_table_size(), 1);
    }
}
