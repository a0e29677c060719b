//! Cache peer pool
//!
//! Routes keys to their owning peer over the internal cache protocol. The
//! receiving side serves straight from its local group without re-routing,
//! so requests never hop more than once.

use crate::ring::HashRing;
use bytes::Bytes;
use kivio_common::{normalize_url, Error, Result, Transport};
use parking_lot::RwLock;
use std::sync::Arc;

/// URL prefix of the internal cache protocol.
pub const BASE_PATH: &str = "/kivio/kv";

/// Consistent-hash pool of cache peers.
pub struct PeerPool {
    self_addr: String,
    ring: RwLock<HashRing>,
    transport: Arc<dyn Transport>,
}

impl PeerPool {
    pub fn new(self_addr: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            self_addr: normalize_url(self_addr),
            ring: RwLock::new(HashRing::new()),
            transport,
        }
    }

    /// Rebuild the ring for a new peer set. Addresses are normalized first;
    /// ring identity depends on the normalized string.
    pub fn set_peers<S: AsRef<str>>(&self, peers: &[S]) {
        let normalized: Vec<String> = peers
            .iter()
            .map(|peer| normalize_url(peer.as_ref()))
            .collect();
        self.ring.write().set_peers(&normalized);
    }

    /// The remote peer owning `key`, or `None` when this node owns it
    /// (or the ring is empty).
    #[must_use]
    pub fn owner_of(&self, key: &str) -> Option<String> {
        let ring = self.ring.read();
        match ring.owner_of(key) {
            Some(owner) if owner != self.self_addr => Some(owner.to_string()),
            _ => None,
        }
    }

    /// Fetch `key` from a peer's local cache.
    pub async fn fetch(&self, peer: &str, key: &str) -> Result<Bytes> {
        let url = format!("{peer}{BASE_PATH}/{key}");
        let res = self.transport.get(&url).await?;
        match res.status {
            200 => Ok(res.body),
            404 => Err(Error::KeyNotFound),
            status => Err(Error::UnexpectedResponse { url, status }),
        }
    }
}
