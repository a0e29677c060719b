//! Database tier master
//!
//! The master owns no authoritative in-memory state: the metadata store is
//! the source of truth for the peer list, and the master serializes every
//! mutation through its own lock. A 1 s heartbeat probes each peer's
//! `/stats` endpoint and evicts the ones that fail; a single failed probe
//! is eviction evidence.

use async_trait::async_trait;
use kivio_common::{normalize_url, Cluster, Config, Error, Result, Transport};
use kivio_meta::MetaStore;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

type NodeStats = HashMap<String, String>;

/// Master of the database node group.
pub struct DbMaster {
    meta: Arc<dyn MetaStore>,
    transport: Arc<dyn Transport>,
    nodes_key: String,
    raft_key: String,
    heartbeat_period: Duration,
    /// Latest stats snapshot per node, refreshed on each heartbeat.
    stats: RwLock<HashMap<String, NodeStats>>,
    /// Serializes read-modify-write of the peer list.
    update_lock: tokio::sync::Mutex<()>,
}

impl DbMaster {
    pub fn new(meta: Arc<dyn MetaStore>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            meta,
            transport,
            nodes_key: config.db_nodes_key.clone(),
            raft_key: config.raft_key.clone(),
            heartbeat_period: config.heartbeat_period(),
            stats: RwLock::new(HashMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current peer list from the metadata store; empty when unset.
    pub async fn peers(&self) -> Result<Vec<String>> {
        match self.meta.get(&self.nodes_key).await {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(Error::KeyNotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Replace the stored peer list, unless it already equals `peers`.
    ///
    /// The list is sorted before writing so observers can compare values
    /// byte for byte.
    pub async fn update_peers(&self, mut peers: Vec<String>) -> Result<()> {
        peers.sort();

        let _guard = self.update_lock.lock().await;

        let current = self.peers().await?;
        if current == peers {
            return Ok(());
        }

        info!(?current, new = ?peers, "updating db peers");
        self.meta
            .put(&self.nodes_key, &serde_json::to_string(&peers)?)
            .await
    }

    /// Record the HTTP address a raft peer is reachable at.
    pub async fn register_peer(&self, raft_addr: &str, http_addr: &str) -> Result<()> {
        self.meta.put(&self.raft_addr_key(raft_addr), http_addr).await
    }

    /// HTTP address registered for `raft_addr`.
    pub async fn peer_http_addr(&self, raft_addr: &str) -> Result<String> {
        self.meta.get(&self.raft_addr_key(raft_addr)).await
    }

    fn raft_addr_key(&self, raft_addr: &str) -> String {
        format!("{}.{}", self.raft_key, raft_addr)
    }

    /// Latest per-node stats snapshot.
    pub fn stats_snapshot(&self) -> HashMap<String, NodeStats> {
        self.stats.read().clone()
    }

    /// Spawn the heartbeat loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let master = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(master.heartbeat_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                master.heartbeat().await;
            }
        })
    }

    /// One heartbeat pass: probe every peer concurrently, wait for all
    /// results, then evict the failed set in a single peer-list rewrite.
    pub async fn heartbeat(&self) {
        let peers = match self.peers().await {
            Ok(peers) => peers,
            Err(err) => {
                error!(%err, "db heartbeat: failed to fetch peers");
                return;
            }
        };
        if peers.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for peer in peers.clone() {
            let transport = Arc::clone(&self.transport);
            probes.spawn(async move {
                let url = format!("{}/stats", normalize_url(&peer));
                let result = fetch_stats(transport.as_ref(), &url).await;
                (peer, result)
            });
        }

        let mut failed = HashSet::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((peer, Ok(stats))) => {
                    self.stats.write().insert(peer, stats);
                }
                Ok((peer, Err(err))) => {
                    warn!(peer, %err, "db heartbeat failed");
                    self.stats.write().remove(&peer);
                    failed.insert(peer);
                }
                Err(err) => error!(%err, "db heartbeat probe panicked"),
            }
        }

        if failed.is_empty() {
            return;
        }

        debug!(?failed, "evicting unreachable db nodes");
        let remaining: Vec<String> = peers
            .into_iter()
            .filter(|peer| !failed.contains(peer))
            .collect();

        if let Err(err) = self.update_peers(remaining).await {
            error!(%err, "db heartbeat: failed to evict peers");
        }
    }
}

async fn fetch_stats(transport: &dyn Transport, url: &str) -> Result<NodeStats> {
    let res = transport.get(url).await?;
    if !res.is_ok() {
        return Err(Error::UnexpectedResponse {
            url: url.to_string(),
            status: res.status,
        });
    }
    res.json()
}

#[async_trait]
impl Cluster for DbMaster {
    async fn peers(&self) -> Result<Vec<String>> {
        DbMaster::peers(self).await
    }
}
