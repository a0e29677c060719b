//! Cache tier master
//!
//! Owns the httpAddr -> nodeAddr map of live cache nodes, mirrored to the
//! metadata store, and pushes topology (cache-protocol peer addresses plus
//! the current DB list) to every node each heartbeat. A node that fails a
//! push is evicted immediately.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use kivio_common::transport::accepts_json;
use kivio_common::{normalize_url, Cluster, Config, Error, Result, Status, Transport};
use kivio_meta::MetaStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct JoinParams {
    #[serde(rename = "httpAddr", default)]
    http_addr: String,
    #[serde(rename = "nodeAddr", default)]
    node_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaPush {
    peers: Vec<String>,
    dbs: Vec<String>,
}

/// Master of the cache node group.
pub struct CacheMaster {
    meta: Arc<dyn MetaStore>,
    transport: Arc<dyn Transport>,
    db_cluster: Arc<dyn Cluster>,
    /// httpAddr -> nodeAddr, both normalized. Ordered so every serialized
    /// or returned list comes out sorted.
    nodes: RwLock<BTreeMap<String, String>>,
    /// Mirror of the DB tier's peer list.
    dbs: RwLock<Vec<String>>,
    nodes_key: String,
    heartbeat_period: Duration,
    /// Serializes join/evict read-modify-write against the metadata store.
    topo_lock: tokio::sync::Mutex<()>,
}

impl CacheMaster {
    /// Build a master, seeding the nodes map from the metadata store.
    pub async fn new(
        meta: Arc<dyn MetaStore>,
        transport: Arc<dyn Transport>,
        db_cluster: Arc<dyn Cluster>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let nodes = match meta.get(&config.cache_nodes_key).await {
            Ok(value) => serde_json::from_str(&value)?,
            Err(Error::KeyNotFound) => BTreeMap::new(),
            Err(err) => return Err(err),
        };

        info!(?nodes, "cache master starting");

        Ok(Arc::new(Self {
            meta,
            transport,
            db_cluster,
            nodes: RwLock::new(nodes),
            dbs: RwLock::new(Vec::new()),
            nodes_key: config.cache_nodes_key.clone(),
            heartbeat_period: config.heartbeat_period(),
            topo_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// HTTP addresses of the registered cache nodes, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/join", post(handle_join))
            .with_state(Arc::clone(self))
    }

    /// Spawn the heartbeat loop.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
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

    /// Spawn the metadata modify-watch, refreshing the DB mirror on change.
    pub fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let master = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = master.meta.watch_modify(&master.nodes_key);
            while rx.recv().await.is_some() {
                if let Err(err) = master.sync_dbs().await {
                    warn!(%err, "sync dbs after modify-watch failed");
                }
            }
        })
    }

    /// Refresh the DB list mirror from the database master.
    pub async fn sync_dbs(&self) -> Result<()> {
        let mut dbs = self.db_cluster.peers().await?;
        dbs.sort();
        *self.dbs.write() = dbs;
        Ok(())
    }

    /// One heartbeat pass: refresh the DB mirror, then push the current
    /// topology to every node, evicting the ones that fail.
    pub async fn heartbeat(&self) {
        if let Err(err) = self.sync_dbs().await {
            warn!(%err, "sync dbs failed, pushing stale db list");
        }

        let nodes = self.nodes.read().clone();
        if nodes.is_empty() {
            return;
        }

        let mut node_addrs: Vec<String> = nodes.values().cloned().collect();
        node_addrs.sort();
        let push = MetaPush {
            peers: node_addrs,
            dbs: self.dbs.read().clone(),
        };
        let body = match serde_json::to_vec(&push) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                error!(%err, "failed to encode topology push");
                return;
            }
        };

        let mut pushes = JoinSet::new();
        for http_addr in nodes.keys().cloned() {
            let transport = Arc::clone(&self.transport);
            let body = body.clone();
            pushes.spawn(async move {
                let url = format!("{http_addr}/meta");
                let delivered = match transport.post(&url, body).await {
                    Ok(res) if res.is_ok() => true,
                    Ok(res) => {
                        warn!(node = http_addr, status = res.status, "heartbeat rejected");
                        false
                    }
                    Err(err) => {
                        warn!(node = http_addr, %err, "heartbeat failed");
                        false
                    }
                };
                (http_addr, delivered)
            });
        }

        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((http_addr, false)) => self.evict(&http_addr).await,
                Err(err) => error!(%err, "heartbeat push panicked"),
            }
        }
    }

    async fn evict(&self, node: &str) {
        let _guard = self.topo_lock.lock().await;

        if self.nodes.write().remove(node).is_none() {
            return;
        }
        warn!(node, "cache node evicted");

        if let Err(err) = self.persist().await {
            error!(node, %err, "failed to persist eviction");
        }
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.nodes.read().clone();
        self.meta
            .put(&self.nodes_key, &serde_json::to_string(&snapshot)?)
            .await
    }
}

async fn handle_join(
    State(master): State<Arc<CacheMaster>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if !accepts_json(content_type) {
        return (StatusCode::BAD_REQUEST, Json(Status::params_error())).into_response();
    }

    let params: JoinParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(Status::params_error())).into_response(),
    };
    if params.http_addr.is_empty() || params.node_addr.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(Status::params_error())).into_response();
    }

    let http_addr = normalize_url(&params.http_addr);
    let node_addr = normalize_url(&params.node_addr);
    info!(http_addr, node_addr, "cache node joining");

    let _guard = master.topo_lock.lock().await;

    master
        .nodes
        .write()
        .insert(http_addr.clone(), node_addr);

    if let Err(err) = master.persist().await {
        error!(http_addr, %err, "failed to persist join");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Status::internal_error()),
        )
            .into_response();
    }

    let reply = MetaPush {
        peers: master.peers(),
        dbs: master.dbs.read().clone(),
    };
    (StatusCode::OK, Json(reply)).into_response()
}

#[async_trait]
impl Cluster for CacheMaster {
    async fn peers(&self) -> Result<Vec<String>> {
        Ok(CacheMaster::peers(self))
    }
}
