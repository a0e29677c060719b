//! Cache node
//!
//! One node of the partitioned cache: an API listener for clients and the
//! master, an internal listener for cache peers, a local cache group, and a
//! loader that races the database tier keeping a "fastest known DB" hint.

use crate::group::{Group, Loader};
use crate::pool::{PeerPool, BASE_PATH};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use kivio_common::fanout::Fanout;
use kivio_common::transport::accepts_json;
use kivio_common::{normalize_url, Config, Error, FastHint, Result, Status, Transport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct MetaParams {
    peers: Vec<String>,
    dbs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JoinRequest {
    #[serde(rename = "httpAddr")]
    http_addr: String,
    #[serde(rename = "nodeAddr")]
    node_addr: String,
}

/// Reads keys from the database tier, remembering the fastest node that
/// answered. This is the loader behind the cache group.
struct DbReader {
    dbs: RwLock<Vec<String>>,
    fast_db: FastHint,
    transport: Arc<dyn Transport>,
    query_timeout: Duration,
}

impl DbReader {
    fn new(transport: Arc<dyn Transport>, query_timeout: Duration) -> Self {
        Self {
            dbs: RwLock::new(Vec::new()),
            fast_db: FastHint::new(),
            transport,
            query_timeout,
        }
    }

    /// Single read against one database node.
    async fn find(
        transport: Arc<dyn Transport>,
        query_timeout: Duration,
        db: &str,
        key: &str,
    ) -> Result<Bytes> {
        let url = format!("{}/i/key/{}", normalize_url(db), key);
        let res = tokio::time::timeout(query_timeout, transport.get(&url))
            .await
            .map_err(|_| Error::Timeout)??;

        match res.status {
            200 if !res.body.is_empty() => Ok(res.body),
            200 => Err(Error::internal(format!("db lost data for key {key}"))),
            404 => Err(Error::KeyNotFound),
            _ => match serde_json::from_slice::<Status>(&res.body).map(Status::into_result) {
                Ok(Err(err)) => Err(err),
                _ => Err(Error::UnexpectedResponse {
                    url,
                    status: res.status,
                }),
            },
        }
    }

    /// Fan out one read per database node and take the first decisive
    /// answer: a value, an authoritative not-found, or the last response
    /// standing. The winner becomes the new fast DB; an expired deadline
    /// clears the hint instead.
    async fn try_all_dbs(&self, key: &str) -> Result<Bytes> {
        let dbs = self.dbs.read().clone();
        if dbs.is_empty() {
            return Err(Error::Unavailable("db"));
        }

        let transport = Arc::clone(&self.transport);
        let query_timeout = self.query_timeout;
        let key_owned = key.to_string();
        let mut fanout = Fanout::spawn(dbs, move |db| {
            let transport = Arc::clone(&transport);
            let key = key_owned.clone();
            async move { Self::find(transport, query_timeout, &db, &key).await }
        });

        let winner = tokio::time::timeout(self.query_timeout, async {
            while let Some(probe) = fanout.recv().await {
                let decisive =
                    probe.outcome.is_ok() || matches!(probe.outcome, Err(Error::KeyNotFound));
                if decisive || fanout.remaining() == 0 {
                    return Some(probe);
                }
            }
            None
        })
        .await;

        match winner {
            Err(_) => {
                self.fast_db.clear();
                Err(Error::Timeout)
            }
            Ok(None) => Err(Error::Unavailable("db")),
            Ok(Some(probe)) => {
                match probe.outcome {
                    Ok(_) | Err(Error::KeyNotFound) => self.fast_db.set(&probe.url),
                    _ => {}
                }
                probe.outcome
            }
        }
    }
}

#[async_trait]
impl Loader for DbReader {
    async fn load(&self, key: &str) -> Result<Bytes> {
        if let Some(fast) = self.fast_db.get() {
            match Self::find(
                Arc::clone(&self.transport),
                self.query_timeout,
                &fast,
                key,
            )
            .await
            {
                Ok(data) => return Ok(data),
                Err(Error::KeyNotFound) => return Err(Error::KeyNotFound),
                Err(err) => {
                    warn!(db = fast, %err, "fast db failed, falling back to fan-out");
                    self.fast_db.clear();
                }
            }
        }

        self.try_all_dbs(key).await
    }
}

/// One cache server.
pub struct CacheNode {
    http_addr: String,
    node_addr: String,
    master_addr: String,
    peers: RwLock<Vec<String>>,
    reader: Arc<DbReader>,
    pool: Arc<PeerPool>,
    group: Arc<Group>,
    transport: Arc<dyn Transport>,
}

impl CacheNode {
    pub fn new(
        http_addr: impl Into<String>,
        node_addr: impl Into<String>,
        master_addr: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Arc<Self> {
        let node_addr = node_addr.into();
        let reader = Arc::new(DbReader::new(
            Arc::clone(&transport),
            config.request_timeout(),
        ));
        let pool = Arc::new(PeerPool::new(&node_addr, Arc::clone(&transport)));
        let group = Arc::new(Group::new(
            config.cache_bytes,
            Arc::clone(&pool),
            reader.clone(),
        ));

        Arc::new(Self {
            http_addr: http_addr.into(),
            node_addr,
            master_addr: master_addr.into(),
            peers: RwLock::new(Vec::new()),
            reader,
            pool,
            group,
            transport,
        })
    }

    /// The API router: client reads, master pushes, stats. The internal
    /// peer route is mounted here too, so a ring seeded from a fresh join
    /// response still resolves until the first master push replaces it.
    pub fn api_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/meta", post(handle_meta))
            .route("/key/:key", get(handle_get))
            .route("/stats", get(handle_stats))
            .route(&format!("{BASE_PATH}/:key"), get(handle_peer_get))
            .with_state(Arc::clone(self))
    }

    /// The internal listener router, serving peers only.
    pub fn peer_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&format!("{BASE_PATH}/:key"), get(handle_peer_get))
            .with_state(Arc::clone(self))
    }

    /// Register with the master and seed topology from its reply.
    /// Failure here is fatal for the process.
    pub async fn join(&self) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(&JoinRequest {
            http_addr: self.http_addr.clone(),
            node_addr: self.node_addr.clone(),
        })?);

        let url = format!("{}/join", normalize_url(&self.master_addr));
        let res = self.transport.post(&url, body).await?;
        if !res.is_ok() {
            return Err(Error::UnexpectedResponse {
                url,
                status: res.status,
            });
        }

        let mut reply: MetaParams = res.json()?;
        reply.peers.sort();
        reply.dbs.sort();

        info!(peers = ?reply.peers, dbs = ?reply.dbs, "joined cache master");

        self.pool.set_peers(&reply.peers);
        *self.peers.write() = reply.peers;
        *self.reader.dbs.write() = reply.dbs;
        Ok(())
    }

    /// Join, then serve both listeners until the process exits.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.join().await?;

        let peer_listener = TcpListener::bind(&self.node_addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let api_listener = TcpListener::bind(&self.http_addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        info!(api = %self.http_addr, peer = %self.node_addr, "cache node serving");

        let peer_serve = axum::serve(peer_listener, self.peer_router()).into_future();
        let api_serve = axum::serve(api_listener, self.api_router()).into_future();
        tokio::try_join!(peer_serve, api_serve).map_err(|e| Error::internal(e.to_string()))?;
        Ok(())
    }

    /// Apply a master topology push. Idempotent: equal sorted lists are
    /// acknowledged without touching any state.
    fn apply_meta(&self, mut params: MetaParams) {
        params.peers.sort();
        params.dbs.sort();

        {
            let peers = self.peers.read();
            let dbs = self.reader.dbs.read();
            if *peers == params.peers && *dbs == params.dbs {
                return;
            }
        }

        info!(peers = ?params.peers, dbs = ?params.dbs, "cache topology updated");

        self.pool.set_peers(&params.peers);
        *self.peers.write() = params.peers;
        *self.reader.dbs.write() = params.dbs;
    }

    #[cfg(test)]
    fn fast_db(&self) -> Option<String> {
        self.reader.fast_db.get()
    }
}

async fn handle_meta(
    State(node): State<Arc<CacheNode>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if !accepts_json(content_type) {
        return (StatusCode::BAD_REQUEST, Json(Status::params_error()));
    }

    let params: MetaParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(Status::params_error())),
    };

    node.apply_meta(params);
    (StatusCode::OK, Json(Status::ok()))
}

async fn handle_get(
    State(node): State<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match node.group.get(&key).await {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            data,
        )
            .into_response(),
        Err(Error::KeyNotFound) => {
            (StatusCode::NOT_FOUND, Json(Status::key_not_found())).into_response()
        }
        Err(err) => {
            warn!(key, %err, "cache read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Status::internal_error())).into_response()
        }
    }
}

async fn handle_peer_get(
    State(node): State<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match node.group.get_locally(&key).await {
        Ok(data) => (StatusCode::OK, data).into_response(),
        Err(Error::KeyNotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(key, %err, "peer-serve failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_stats(State(node): State<Arc<CacheNode>>) -> impl IntoResponse {
    (StatusCode::OK, Json(node.group.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kivio_common::mock::MockTransport;
    use kivio_common::status;
    use tower::ServiceExt;

    const HTTP: &str = "127.0.0.1:7001";
    const NODE: &str = "127.0.0.1:7101";
    const MASTER: &str = "127.0.0.1:5550";
    const DB_A: &str = "127.0.0.1:5501";
    const DB_B: &str = "127.0.0.1:5502";

    fn test_config() -> Config {
        Config {
            request_timeout_ms: 100,
            ideal_response_ms: 50,
            ..Config::default()
        }
    }

    fn new_node(transport: Arc<MockTransport>) -> Arc<CacheNode> {
        CacheNode::new(HTTP, NODE, MASTER, transport, &test_config())
    }

    fn seed(node: &Arc<CacheNode>, dbs: &[&str]) {
        node.pool.set_peers(&[NODE]);
        *node.peers.write() = vec![normalize_url(NODE)];
        *node.reader.dbs.write() = dbs.iter().map(|db| db.to_string()).collect();
    }

    async fn api_get(node: &Arc<CacheNode>, uri: &str) -> (StatusCode, Bytes) {
        let res = node
            .api_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_join_seeds_topology() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            MASTER,
            200,
            r#"{"peers":["http://127.0.0.1:7001"],"dbs":["127.0.0.1:5502","127.0.0.1:5501"]}"#,
        );

        let node = new_node(transport.clone());
        node.join().await.unwrap();

        assert_eq!(*node.peers.read(), vec!["http://127.0.0.1:7001".to_string()]);
        // Seeded lists are sorted.
        assert_eq!(
            *node.reader.dbs.read(),
            vec![DB_A.to_string(), DB_B.to_string()]
        );

        let posts = transport.posts();
        assert_eq!(posts[0].0, "http://127.0.0.1:5550/join");
        let body: serde_json::Value = serde_json::from_slice(&posts[0].1).unwrap();
        assert_eq!(body["httpAddr"], HTTP);
        assert_eq!(body["nodeAddr"], NODE);
    }

    #[tokio::test]
    async fn test_join_failure_is_fatal() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(MASTER);

        let node = new_node(transport);
        assert!(node.join().await.is_err());
    }

    #[tokio::test]
    async fn test_meta_is_idempotent_and_updates() {
        let node = new_node(Arc::new(MockTransport::new()));
        seed(&node, &[DB_A]);

        // Same topology in a different order: acknowledged, nothing changes.
        node.apply_meta(MetaParams {
            peers: vec![normalize_url(NODE)],
            dbs: vec![DB_A.to_string()],
        });
        assert_eq!(*node.reader.dbs.read(), vec![DB_A.to_string()]);

        // New DB appears.
        node.apply_meta(MetaParams {
            peers: vec![normalize_url(NODE)],
            dbs: vec![DB_B.to_string(), DB_A.to_string()],
        });
        assert_eq!(
            *node.reader.dbs.read(),
            vec![DB_A.to_string(), DB_B.to_string()]
        );
    }

    #[tokio::test]
    async fn test_read_hit_serves_raw_db_body() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(DB_A, 200, r#"{"key":"foo","value":"bar"}"#);

        let node = new_node(transport);
        seed(&node, &[DB_A]);

        let (status, body) = api_get(&node, "/key/foo").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(br#"{"key":"foo","value":"bar"}"#));
    }

    #[tokio::test]
    async fn test_read_miss_returns_404() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(DB_A, 404, r#"{"code":1002,"message":"key not found"}"#);

        let node = new_node(transport);
        seed(&node, &[DB_A]);

        let (status, body) = api_get(&node, "/key/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::KEY_NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_promotes_fastest_db() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with_delay(
            DB_A,
            200,
            r#"{"key":"foo","value":"bar"}"#,
            Duration::from_millis(10),
        );
        transport.respond_with_delay(
            DB_B,
            200,
            r#"{"key":"foo","value":"bar"}"#,
            Duration::from_millis(80),
        );

        let node = new_node(transport);
        seed(&node, &[DB_A, DB_B]);

        assert!(node.fast_db().is_none());
        node.group.get("foo").await.unwrap();
        assert_eq!(node.fast_db().as_deref(), Some(DB_A));
    }

    #[tokio::test]
    async fn test_fast_db_not_found_is_final() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(DB_A, 404, "");
        // DB_B would answer, but the fast path's not-found must win.
        transport.respond(DB_B, 200, r#"{"key":"foo","value":"bar"}"#);

        let node = new_node(transport);
        seed(&node, &[DB_A, DB_B]);
        node.reader.fast_db.set(DB_A);

        assert!(matches!(
            node.group.get("foo").await,
            Err(Error::KeyNotFound)
        ));
        assert_eq!(node.fast_db().as_deref(), Some(DB_A));
    }

    #[tokio::test]
    async fn test_fast_db_error_falls_back_to_fanout() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(DB_A);
        transport.respond(DB_B, 200, r#"{"key":"foo","value":"bar"}"#);

        let node = new_node(transport);
        seed(&node, &[DB_A, DB_B]);
        node.reader.fast_db.set(DB_A);

        node.group.get("foo").await.unwrap();
        assert_eq!(node.fast_db().as_deref(), Some(DB_B));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_clears_fast_db() {
        let transport = Arc::new(MockTransport::new());
        // Both DBs hang past the 100 ms query deadline.
        transport.respond_with_delay(DB_A, 200, "{}", Duration::from_millis(400));
        transport.respond_with_delay(DB_B, 200, "{}", Duration::from_millis(400));

        let node = new_node(transport);
        seed(&node, &[DB_A, DB_B]);
        node.reader.fast_db.set(DB_A);

        // The fast path times out, clears the hint, and the fan-out's own
        // deadline then expires too.
        assert!(matches!(
            node.group.get("foo").await,
            Err(Error::Timeout)
        ));
        assert!(node.fast_db().is_none());
    }

    #[tokio::test]
    async fn test_no_dbs_is_unavailable() {
        let node = new_node(Arc::new(MockTransport::new()));
        seed(&node, &[]);

        assert!(matches!(
            node.group.get("foo").await,
            Err(Error::Unavailable("db"))
        ));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let node = new_node(Arc::new(MockTransport::new()));
        seed(&node, &[]);

        let (status, body) = api_get(&node, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: std::collections::HashMap<String, u64> =
            serde_json::from_slice(&body).unwrap();
        assert!(stats.contains_key("hits"));
        assert!(stats.contains_key("loads"));
    }
}
