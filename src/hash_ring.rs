//! Consistent-hash ring over worker ids.
//!
//! Mirrors the teacher's `ConsistentHashPolicy` (virtual nodes, ring
//! rebuild on membership change) but swaps MurmurHash/furc_hash for the
//! FNV-1a function the design spec mandates, and a sorted `Vec` + binary
//! search in place of a `BTreeMap`, since the spec calls out a logarithmic
//! lookup over a sorted slice specifically.

use std::cmp::Ordering;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over the UTF-8 bytes of `key`, folded to 32 bits.
pub fn fnv1a(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
struct RingNode {
    hash: u32,
    worker_id: String,
}

/// Sorted hash ring of virtual nodes. Not thread-safe on its own; the
/// `StickyRouter` wraps it in a lock.
#[derive(Debug, Default)]
pub struct HashRing {
    virtual_nodes: u32,
    nodes: Vec<RingNode>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            nodes: Vec::new(),
        }
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Idempotent: re-adding a worker that already has nodes on the ring is a no-op.
    pub fn add_worker(&mut self, worker_id: &str) {
        if self.nodes.iter().any(|n| n.worker_id == worker_id) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let key = format!("{worker_id}:{i}");
            let hash = fnv1a(&key);
            let pos = self
                .nodes
                .binary_search_by(|n| n.hash.cmp(&hash))
                .unwrap_or_else(|e| e);
            self.nodes.insert(
                pos,
                RingNode {
                    hash,
                    worker_id: worker_id.to_string(),
                },
            );
        }
    }

    /// Idempotent: removing a worker with no ring nodes is a no-op.
    pub fn remove_worker(&mut self, worker_id: &str) {
        self.nodes.retain(|n| n.worker_id != worker_id);
    }

    /// First node whose hash is >= `target`, wrapping to the lowest-hash node.
    pub fn lookup(&self, target: u32) -> Option<&str> {
        if self.nodes.is_empty() {
            return None;
        }
        let idx = match self.nodes.binary_search_by(|n| {
            if n.hash < target {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }) {
            Ok(i) | Err(i) => i,
        };
        let idx = if idx >= self.nodes.len() { 0 } else { idx };
        Some(self.nodes[idx].worker_id.as_str())
    }

    pub fn lookup_key(&self, key: &str) -> Option<&str> {
        self.lookup(fnv1a(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_deterministic() {
        assert_eq!(fnv1a("worker-0:3"), fnv1a("worker-0:3"));
        assert_ne!(fnv1a("worker-0:3"), fnv1a("worker-0:4"));
    }

    #[test]
    fn empty_ring_has_no_lookup() {
        let ring = HashRing::new(150);
        assert_eq!(ring.lookup(0), None);
    }

    #[test]
    fn add_then_remove_restores_empty_ring() {
        let mut ring = HashRing::new(150);
        ring.add_worker("worker-0");
        assert_eq!(ring.len(), 150);
        ring.remove_worker("worker-0");
        assert!(ring.is_empty());
    }

    #[test]
    fn add_worker_is_idempotent() {
        let mut ring = HashRing::new(150);
        ring.add_worker("worker-0");
        ring.add_worker("worker-0");
        assert_eq!(ring.len(), 150);
    }

    #[test]
    fn lookup_wraps_around() {
        let mut ring = HashRing::new(10);
        ring.add_worker("worker-0");
        ring.add_worker("worker-1");
        // u32::MAX is >= every node's hash, so lookup must wrap to the first.
        assert!(ring.lookup(u32::MAX).is_some());
    }
}
