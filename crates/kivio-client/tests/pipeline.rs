//! End-to-end pipeline tests
//!
//! Wires real routers from every tier (db node, cache master, cache node)
//! through an in-process transport that dispatches requests straight into
//! them, then drives the whole system with the client. No sockets involved.

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use kivio_cache::{CacheMaster, CacheNode};
use kivio_client::Client;
use kivio_common::{Cluster, Config, Error, Response, Result, Transport};
use kivio_db::{DbMaster, DbService, LocalStore};
use kivio_meta::MemStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const DB_HTTP: &str = "127.0.0.1:5500";
const DB_RAFT: &str = "127.0.0.1:5600";
const MASTER_HOST: &str = "127.0.0.1:5550";
const CACHE_HTTP: &str = "127.0.0.1:7001";
const CACHE_NODE: &str = "127.0.0.1:7101";

/// Transport that dispatches requests into mounted axum routers by host.
#[derive(Default)]
struct RouterTransport {
    routes: RwLock<HashMap<String, Router>>,
}

impl RouterTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mount(&self, host: &str, router: Router) {
        self.routes.write().insert(host.to_string(), router);
    }

    async fn dispatch(&self, url: &str, method: &str, body: Option<Bytes>) -> Result<Response> {
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url);
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, format!("/{path}")),
            None => (rest, "/".to_string()),
        };

        let router = self
            .routes
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("no service at {host}")))?;

        let mut builder = axum::http::Request::builder().method(method).uri(path);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(axum::body::Body::from(body.unwrap_or_default()))
            .map_err(|e| Error::internal(e.to_string()))?;

        let response = router
            .oneshot(request)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let status = response.status().as_u16();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        Ok(Response { status, body })
    }
}

#[async_trait]
impl Transport for RouterTransport {
    async fn get(&self, url: &str) -> Result<Response> {
        self.dispatch(url, "GET", None).await
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Response> {
        self.dispatch(url, "POST", Some(body)).await
    }
}

struct System {
    client: Arc<Client>,
    meta: Arc<MemStore>,
    _data_dir: tempfile::TempDir,
}

/// Bring up one node of each tier, in dependency order, and build a client
/// against the two masters.
async fn boot(transport: Arc<RouterTransport>, mount_cache: bool) -> System {
    let config = Config::default();
    let meta = Arc::new(MemStore::new());

    let db_master = Arc::new(DbMaster::new(
        meta.clone(),
        transport.clone(),
        &config,
    ));

    let data_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(DB_RAFT, data_dir.path()));
    let db_service = DbService::new(
        DB_HTTP,
        DB_RAFT,
        store,
        db_master.clone(),
        transport.clone(),
    );
    db_service.bootstrap().await.unwrap();
    transport.mount(DB_HTTP, db_service.router());

    let cache_master = CacheMaster::new(
        meta.clone(),
        transport.clone(),
        db_master.clone() as Arc<dyn Cluster>,
        &config,
    )
    .await
    .unwrap();
    cache_master.sync_dbs().await.unwrap();
    transport.mount(MASTER_HOST, cache_master.router());

    let node = CacheNode::new(CACHE_HTTP, CACHE_NODE, MASTER_HOST, transport.clone(), &config);
    node.join().await.unwrap();
    if mount_cache {
        transport.mount(CACHE_HTTP, node.api_router());
    }

    let client = Client::new(
        db_master as Arc<dyn Cluster>,
        cache_master as Arc<dyn Cluster>,
        transport.clone(),
        &config,
    )
    .await
    .unwrap();

    System {
        client,
        meta,
        _data_dir: data_dir,
    }
}

#[tokio::test]
async fn test_single_node_bootstrap_registers_topology() {
    use kivio_meta::MetaStore;

    let system = boot(RouterTransport::new(), true).await;

    assert_eq!(
        system.meta.get("kivio.db.nodes").await.unwrap(),
        r#"["127.0.0.1:5500"]"#
    );
    assert_eq!(
        system
            .meta
            .get("kivio.db.node.raft.127.0.0.1:5600")
            .await
            .unwrap(),
        DB_HTTP
    );
    assert_eq!(
        system.meta.get("kivio.cache.nodes").await.unwrap(),
        r#"{"http://127.0.0.1:7001":"http://127.0.0.1:7101"}"#
    );
}

#[tokio::test]
async fn test_put_get_round_trip_through_all_tiers() {
    let system = boot(RouterTransport::new(), true).await;
    let client = &system.client;

    client.put("foo", "bar").await.unwrap();

    // First read misses the cache and loads from the db; the second is a
    // cache hit. Both observe the write.
    assert_eq!(client.get("foo").await.unwrap(), "bar");
    assert_eq!(client.get("foo").await.unwrap(), "bar");
}

#[tokio::test]
async fn test_duplicate_write_is_rejected_and_value_sticks() {
    let system = boot(RouterTransport::new(), true).await;
    let client = &system.client;

    client.put("k", "v1").await.unwrap();
    assert!(matches!(
        client.put("k", "v2").await,
        Err(Error::KeyDuplicate(_))
    ));
    assert_eq!(client.get("k").await.unwrap(), "v1");
}

#[tokio::test]
async fn test_missing_key_is_not_found() {
    let system = boot(RouterTransport::new(), true).await;

    assert!(matches!(
        system.client.get("never-written").await,
        Err(Error::KeyNotFound)
    ));
}

#[tokio::test]
async fn test_cache_tier_down_reads_fall_back_to_db() {
    // The cache node joined the master but its API is unreachable.
    let system = boot(RouterTransport::new(), false).await;
    let client = &system.client;

    client.put("foo", "bar").await.unwrap();
    assert_eq!(client.get("foo").await.unwrap(), "bar");
}
