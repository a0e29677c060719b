//! Cache group
//!
//! One group per node: local byte-budget LRU in front of the peer pool, with
//! single-flight coalescing so a burst of misses for one key costs a single
//! load. Peer-fetched values are not cached locally; the owning node caches
//! them.

use crate::lru::ByteCache;
use crate::pool::PeerPool;
use async_trait::async_trait;
use bytes::Bytes;
use kivio_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Loads a value on cache miss, typically from the database tier.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &str) -> Result<Bytes>;
}

/// Shareable outcome of an in-flight load.
#[derive(Clone)]
enum FlightResult {
    Found(Bytes),
    NotFound,
    Failed(String),
}

impl FlightResult {
    fn from_result(result: &Result<Bytes>) -> Self {
        match result {
            Ok(data) => Self::Found(data.clone()),
            Err(Error::KeyNotFound) => Self::NotFound,
            Err(err) => Self::Failed(err.to_string()),
        }
    }

    fn into_result(self) -> Result<Bytes> {
        match self {
            Self::Found(data) => Ok(data),
            Self::NotFound => Err(Error::KeyNotFound),
            Self::Failed(msg) => Err(Error::Internal(msg)),
        }
    }
}

type FlightRx = watch::Receiver<Option<FlightResult>>;

/// A named, partitioned cache group.
pub struct Group {
    cache: ByteCache,
    pool: Arc<PeerPool>,
    loader: Arc<dyn Loader>,
    flights: Mutex<HashMap<String, FlightRx>>,
    loads: AtomicU64,
    peer_loads: AtomicU64,
}

impl Group {
    pub fn new(cache_bytes: u64, pool: Arc<PeerPool>, loader: Arc<dyn Loader>) -> Self {
        Self {
            cache: ByteCache::new(cache_bytes),
            pool,
            loader,
            flights: Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
            peer_loads: AtomicU64::new(0),
        }
    }

    /// Full read path: local cache, then the owning peer, then a local load.
    ///
    /// A peer's authoritative not-found is final; any other peer failure
    /// falls back to loading locally.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        if let Some(data) = self.cache.get(key) {
            return Ok(data);
        }

        if let Some(owner) = self.pool.owner_of(key) {
            self.peer_loads.fetch_add(1, Ordering::Relaxed);
            match self.pool.fetch(&owner, key).await {
                Ok(data) => return Ok(data),
                Err(Error::KeyNotFound) => return Err(Error::KeyNotFound),
                Err(err) => {
                    warn!(key, owner, %err, "peer fetch failed, loading locally");
                }
            }
        }

        self.get_locally(key).await
    }

    /// Local-only read path, also serving peer requests: cache lookup, then
    /// a single-flight load. Never routes back to the ring.
    pub async fn get_locally(&self, key: &str) -> Result<Bytes> {
        if let Some(data) = self.cache.get(key) {
            return Ok(data);
        }

        enum Role {
            Leader(watch::Sender<Option<FlightResult>>),
            Follower(FlightRx),
        }

        let role = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                let result = self.loader.load(key).await;

                if let Ok(data) = &result {
                    self.cache.insert(key, data.clone());
                }

                self.flights.lock().remove(key);
                let _ = tx.send(Some(FlightResult::from_result(&result)));
                result
            }
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result.into_result();
                }
                if rx.changed().await.is_err() {
                    return Err(Error::internal("coalesced load was dropped"));
                }
            },
        }
    }

    /// Counter snapshot for the stats endpoint.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut stats = self.cache.snapshot();
        stats.insert("loads".to_string(), self.loads.load(Ordering::Relaxed));
        stats.insert(
            "peer_loads".to_string(),
            self.peer_loads.load(Ordering::Relaxed),
        );
        stats
    }
}
