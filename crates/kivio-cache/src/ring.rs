//! Consistent hash ring
//!
//! Each peer claims a set of virtual points on a crc32c keyspace; a key
//! belongs to the first point at or after its own hash, wrapping around.
//! Ring identity is the normalized address string, so the same peer always
//! lands on the same points on every node.

use std::collections::HashMap;

/// Virtual points per peer.
const DEFAULT_REPLICAS: usize = 50;

/// Consistent hash ring over peer addresses.
#[derive(Debug, Default)]
pub struct HashRing {
    replicas: usize,
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl HashRing {
    #[must_use]
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    #[must_use]
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Rebuild the ring for a new peer set.
    pub fn set_peers<S: AsRef<str>>(&mut self, peers: &[S]) {
        self.points.clear();
        self.owners.clear();

        for peer in peers {
            let peer = peer.as_ref();
            for i in 0..self.replicas {
                let point = crc32c::crc32c(format!("{peer}#{i}").as_bytes());
                self.points.push(point);
                self.owners.insert(point, peer.to_string());
            }
        }

        self.points.sort_unstable();
        self.points.dedup();
    }

    /// Peer owning `key`; `None` on an empty ring.
    #[must_use]
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = crc32c::crc32c(key.as_bytes());
        let idx = self.points.partition_point(|point| *point < hash);
        let point = self.points[idx % self.points.len()];
        self.owners.get(&point).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
