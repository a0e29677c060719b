//! HTTP service for a database node
//!
//! Serves the key/value API and the cluster join endpoint. Reads and writes
//! are leader-only; a follower answers with the NotLeader status carrying
//! the leader's HTTP address when it can resolve one, so callers can retry
//! directly instead of re-fanning out.

use crate::master::DbMaster;
use crate::store::Store;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use kivio_common::transport::accepts_json;
use kivio_common::{normalize_url, Error, Result, Status, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct KvBody {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinParams {
    addr: String,
}

/// HTTP service wrapping a [`Store`].
pub struct DbService {
    http_addr: String,
    raft_addr: String,
    store: Arc<dyn Store>,
    master: Arc<DbMaster>,
    transport: Arc<dyn Transport>,
}

impl DbService {
    pub fn new(
        http_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        store: Arc<dyn Store>,
        master: Arc<DbMaster>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
            store,
            master,
            transport,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/i/key/:key", get(handle_get))
            .route("/key", post(handle_set))
            .route("/join", post(handle_join))
            .route("/stats", get(handle_stats))
            .with_state(Arc::clone(self))
    }

    /// Register with the master and open the store: bootstrap a new
    /// single-node cluster when no peers exist, otherwise join as a
    /// follower. Failure here is fatal for the process.
    pub async fn bootstrap(&self) -> Result<()> {
        self.master
            .register_peer(&self.raft_addr, &self.http_addr)
            .await?;

        let peers = self.master.peers().await?;
        info!(?peers, "db node bootstrap");

        if peers.is_empty() {
            self.store.open(true).await?;
            self.master.update_peers(vec![self.http_addr.clone()]).await?;
        } else {
            self.store.open(false).await?;
            self.try_to_join(&peers).await?;
        }

        Ok(())
    }

    /// Bootstrap, then serve until the process exits.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.bootstrap().await?;

        let listener = TcpListener::bind(&self.http_addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        info!(addr = %self.http_addr, "db node serving");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::internal(e.to_string()))
    }

    async fn try_to_join(&self, peers: &[String]) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(&JoinParams {
            addr: self.raft_addr.clone(),
        })?);

        let mut attempts = 0;
        for peer in peers {
            if peer == &self.http_addr {
                continue;
            }
            attempts += 1;

            let url = format!("{}/join", normalize_url(peer));
            match self.transport.post(&url, body.clone()).await {
                Ok(res) if res.is_ok() => {
                    info!(peer, "joined cluster");
                    return Ok(());
                }
                Ok(res) => warn!(peer, status = res.status, "join refused"),
                Err(err) => warn!(peer, %err, "join attempt failed"),
            }
        }

        Err(Error::JoinRefused(attempts))
    }

    fn is_leader(&self) -> bool {
        self.store.leader() == self.raft_addr
    }

    /// HTTP address of the current leader, for NotLeader redirects.
    async fn leader_http_addr(&self) -> Option<String> {
        let leader_raft = self.store.leader();
        if leader_raft.is_empty() {
            return None;
        }
        if leader_raft == self.raft_addr {
            return Some(self.http_addr.clone());
        }
        self.master.peer_http_addr(&leader_raft).await.ok()
    }

    /// Recompute the HTTP peer list from the store's raft peers and push it
    /// through the master. Runs after a successful join.
    async fn update_peers_from_store(&self) -> Result<()> {
        let raft_peers = self.store.peers().await?;
        if raft_peers.is_empty() {
            return self.master.update_peers(vec![self.http_addr.clone()]).await;
        }

        let mut peers = Vec::with_capacity(raft_peers.len());
        for raft_addr in raft_peers {
            peers.push(self.master.peer_http_addr(&raft_addr).await?);
        }

        self.master.update_peers(peers).await
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Option<T> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if !accepts_json(content_type) {
        return None;
    }
    serde_json::from_slice(body).ok()
}

async fn handle_get(
    State(service): State<Arc<DbService>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    if !service.is_leader() {
        let leader = service.leader_http_addr().await;
        return (StatusCode::BAD_REQUEST, Json(Status::not_leader(leader))).into_response();
    }

    match service.store.get(&key).await {
        Ok(value) => (StatusCode::OK, Json(KvBody { key, value })).into_response(),
        Err(Error::KeyNotFound) => {
            (StatusCode::NOT_FOUND, Json(Status::key_not_found())).into_response()
        }
        Err(err) => {
            error!(key, %err, "store read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Status::internal_error())).into_response()
        }
    }
}

async fn handle_set(
    State(service): State<Arc<DbService>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !service.is_leader() {
        let leader = service.leader_http_addr().await;
        return (StatusCode::OK, Json(Status::not_leader(leader)));
    }

    let params: KvBody = match parse_body(&headers, &body) {
        Some(params) => params,
        None => return (StatusCode::OK, Json(Status::params_error())),
    };
    if params.key.is_empty() {
        return (StatusCode::OK, Json(Status::params_error()));
    }

    match service.store.add(&params.key, &params.value).await {
        Ok(()) => (StatusCode::OK, Json(Status::ok())),
        Err(Error::KeyDuplicate(_)) => (StatusCode::OK, Json(Status::key_duplicate())),
        Err(err) => {
            error!(key = params.key, %err, "store add failed");
            (StatusCode::OK, Json(Status::internal_error()))
        }
    }
}

async fn handle_join(
    State(service): State<Arc<DbService>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !service.is_leader() {
        let leader = service.leader_http_addr().await;
        return (StatusCode::BAD_REQUEST, Json(Status::not_leader(leader)));
    }

    let params: JoinParams = match parse_body(&headers, &body) {
        Some(params) => params,
        None => return (StatusCode::BAD_REQUEST, Json(Status::params_error())),
    };

    if let Err(err) = service.store.join(&params.addr).await {
        error!(addr = params.addr, %err, "raft join failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Status::internal_error()),
        );
    }

    info!(addr = params.addr, "node joined raft cluster");

    let service = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(err) = service.update_peers_from_store().await {
            error!(%err, "failed to republish peer list after join");
        }
    });

    (StatusCode::OK, Json(Status::ok()))
}

async fn handle_stats(State(service): State<Arc<DbService>>) -> impl IntoResponse {
    (StatusCode::OK, Json(service.store.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kivio_common::mock::MockTransport;
    use kivio_common::{status, Config};
    use kivio_meta::{MemStore, MetaStore};
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Scriptable in-memory store double.
    #[derive(Default)]
    struct MockStore {
        leader: RwLock<String>,
        data: RwLock<HashMap<String, String>>,
        raft_peers: RwLock<Vec<String>>,
        opened_single: RwLock<Option<bool>>,
    }

    impl MockStore {
        fn leading(raft_addr: &str) -> Arc<Self> {
            let store = Self::default();
            *store.leader.write() = raft_addr.to_string();
            Arc::new(store)
        }
    }

    #[async_trait]
    impl Store for MockStore {
        async fn open(&self, single: bool) -> kivio_common::Result<()> {
            *self.opened_single.write() = Some(single);
            Ok(())
        }

        async fn get(&self, key: &str) -> kivio_common::Result<String> {
            self.data.read().get(key).cloned().ok_or(Error::KeyNotFound)
        }

        async fn add(&self, key: &str, value: &str) -> kivio_common::Result<()> {
            let mut data = self.data.write();
            if data.contains_key(key) {
                return Err(Error::KeyDuplicate(key.to_string()));
            }
            data.insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn join(&self, raft_addr: &str) -> kivio_common::Result<()> {
            self.raft_peers.write().push(raft_addr.to_string());
            Ok(())
        }

        async fn peers(&self) -> kivio_common::Result<Vec<String>> {
            Ok(self.raft_peers.read().clone())
        }

        fn leader(&self) -> String {
            self.leader.read().clone()
        }

        fn stats(&self) -> HashMap<String, String> {
            HashMap::from([("keys".to_string(), self.data.read().len().to_string())])
        }
    }

    const HTTP: &str = "127.0.0.1:5500";
    const RAFT: &str = "127.0.0.1:5600";

    struct Fixture {
        service: Arc<DbService>,
        store: Arc<MockStore>,
        meta: Arc<MemStore>,
        transport: Arc<MockTransport>,
    }

    fn fixture(store: Arc<MockStore>) -> Fixture {
        let meta = Arc::new(MemStore::new());
        let transport = Arc::new(MockTransport::new());
        let master = Arc::new(DbMaster::new(
            meta.clone(),
            transport.clone(),
            &Config::default(),
        ));
        let service = DbService::new(HTTP, RAFT, store.clone(), master, transport.clone());
        Fixture {
            service,
            store,
            meta,
            transport,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Bytes) {
        let res = router
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

    async fn post(router: Router, uri: &str, content_type: &str, body: &str) -> (StatusCode, Bytes) {
        let res = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", content_type)
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_get_found_and_missing() {
        let fx = fixture(MockStore::leading(RAFT));
        fx.store.data.write().insert("foo".into(), "bar".into());

        let (status, body) = get(fx.service.router(), "/i/key/foo").await;
        assert_eq!(status, StatusCode::OK);
        let kv: KvBody = serde_json::from_slice(&body).unwrap();
        assert_eq!((kv.key.as_str(), kv.value.as_str()), ("foo", "bar"));

        let (status, body) = get(fx.service.router(), "/i/key/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::KEY_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_follower_redirects_with_leader_hint() {
        let fx = fixture(MockStore::leading("127.0.0.1:5601"));
        // The leader's raft address resolves to its HTTP address.
        fx.meta
            .put("kivio.db.node.raft.127.0.0.1:5601", "127.0.0.1:5501")
            .await
            .unwrap();

        let (status, body) = get(fx.service.router(), "/i/key/foo").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::NOT_LEADER);
        assert_eq!(st.leader.as_deref(), Some("127.0.0.1:5501"));
    }

    #[tokio::test]
    async fn test_set_ok_duplicate_and_params_error() {
        let fx = fixture(MockStore::leading(RAFT));

        let (status, body) = post(
            fx.service.router(),
            "/key",
            "application/json",
            r#"{"key":"k","value":"v1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::OK);

        let (_, body) = post(
            fx.service.router(),
            "/key",
            "application/json",
            r#"{"key":"k","value":"v2"}"#,
        )
        .await;
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::KEY_DUPLICATE);
        assert_eq!(fx.store.data.read()["k"], "v1");

        let (status, body) = post(fx.service.router(), "/key", "application/json", "not json").await;
        assert_eq!(status, StatusCode::OK);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::PARAMS_ERROR);
    }

    #[tokio::test]
    async fn test_content_type_alias_accepted() {
        let fx = fixture(MockStore::leading(RAFT));

        let (_, body) = post(
            fx.service.router(),
            "/key",
            "application-type/json",
            r#"{"key":"aliased","value":"v"}"#,
        )
        .await;
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::OK);
    }

    #[tokio::test]
    async fn test_join_updates_peer_list() {
        let fx = fixture(MockStore::leading(RAFT));
        // Both nodes registered their raft -> http mapping beforehand.
        fx.meta
            .put("kivio.db.node.raft.127.0.0.1:5600", HTTP)
            .await
            .unwrap();
        fx.meta
            .put("kivio.db.node.raft.127.0.0.1:5601", "127.0.0.1:5501")
            .await
            .unwrap();
        fx.store.raft_peers.write().push(RAFT.to_string());

        let (status, body) = post(
            fx.service.router(),
            "/join",
            "application/json",
            r#"{"addr":"127.0.0.1:5601"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let st: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(st.code, status::OK);

        // The HTTP peer list is recomputed asynchronously.
        let mut stored = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Ok(value) = fx.meta.get("kivio.db.nodes").await {
                stored = value;
                break;
            }
        }
        assert_eq!(stored, r#"["127.0.0.1:5500","127.0.0.1:5501"]"#);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let fx = fixture(MockStore::leading(RAFT));
        let (status, body) = get(fx.service.router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: HashMap<String, String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["keys"], "0");
    }

    #[tokio::test]
    async fn test_bootstrap_single_node() {
        let fx = fixture(MockStore::leading(RAFT));

        fx.service.bootstrap().await.unwrap();

        assert_eq!(*fx.store.opened_single.read(), Some(true));
        assert_eq!(
            fx.meta.get("kivio.db.node.raft.127.0.0.1:5600").await.unwrap(),
            HTTP
        );
        assert_eq!(
            fx.meta.get("kivio.db.nodes").await.unwrap(),
            r#"["127.0.0.1:5500"]"#
        );
    }

    #[tokio::test]
    async fn test_bootstrap_joins_existing_cluster() {
        let fx = fixture(MockStore::leading(RAFT));
        fx.meta
            .put("kivio.db.nodes", r#"["127.0.0.1:5501"]"#)
            .await
            .unwrap();
        fx.transport
            .respond("127.0.0.1:5501", 200, r#"{"code":1000,"message":""}"#);

        fx.service.bootstrap().await.unwrap();

        assert_eq!(*fx.store.opened_single.read(), Some(false));
        let posts = fx.transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "http://127.0.0.1:5501/join");
    }

    #[tokio::test]
    async fn test_bootstrap_fatal_when_all_peers_refuse() {
        let fx = fixture(MockStore::leading(RAFT));
        fx.meta
            .put("kivio.db.nodes", r#"["127.0.0.1:5501"]"#)
            .await
            .unwrap();
        fx.transport.fail("127.0.0.1:5501");

        assert!(matches!(
            fx.service.bootstrap().await,
            Err(Error::JoinRefused(1))
        ));
    }
}
