//! Key/value operations
//!
//! Reads try the fast cache, then fan out across the cache tier, then fall
//! back to the database tier; an authoritative not-found from the cache
//! tier is final. Writes bypass the cache tier entirely. Both paths promote
//! the endpoint that answered fastest and demote it again when it turns
//! slow or unreachable.

use crate::Client;
use bytes::Bytes;
use kivio_common::fanout::Fanout;
use kivio_common::{normalize_url, Error, FastHint, Result, Status, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct KvBody {
    key: String,
    value: String,
}

#[derive(Clone, Copy)]
enum Tier {
    Cache,
    Db,
}

impl Tier {
    fn kind(self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Db => "db",
        }
    }

    fn read_url(self, base: &str, key: &str) -> String {
        match self {
            Tier::Cache => format!("{}/key/{}", normalize_url(base), key),
            Tier::Db => format!("{}/i/key/{}", normalize_url(base), key),
        }
    }
}

impl Client {
    /// Value of `key`.
    ///
    /// `Error::KeyNotFound` is an authoritative answer from whichever tier
    /// produced it first.
    pub async fn get(&self, key: &str) -> Result<String> {
        match self.get_from_cache(key).await {
            Ok(value) => Ok(value),
            Err(Error::KeyNotFound) => Err(Error::KeyNotFound),
            Err(err) => {
                debug!(%err, "cache tier failed, reading database tier");
                self.get_from_db(key).await
            }
        }
    }

    /// Write `key`/`value`. Keys are write-once: a second write of the same
    /// key fails with `Error::KeyDuplicate`.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(&KvBody {
            key: key.to_string(),
            value: value.to_string(),
        })?);

        if let Some(fast) = self.fast_db.get() {
            let begin = Instant::now();
            match self.set_value(&fast, body.clone()).await {
                Ok(()) => {
                    if begin.elapsed() > self.ideal_response {
                        self.fast_db.clear();
                    }
                    return Ok(());
                }
                Err(Error::KeyDuplicate(key)) => return Err(Error::KeyDuplicate(key)),
                Err(Error::NotLeader(Some(leader))) => {
                    // The follower told us who leads; try it directly before
                    // paying for a fan-out.
                    match self.set_value(&leader, body.clone()).await {
                        Ok(()) => {
                            self.fast_db.set(&leader);
                            return Ok(());
                        }
                        Err(Error::KeyDuplicate(key)) => return Err(Error::KeyDuplicate(key)),
                        Err(err) => debug!(leader, %err, "leader retry failed"),
                    }
                    self.fast_db.clear();
                }
                Err(err) => {
                    debug!(db = fast, %err, "fast db put failed");
                    self.fast_db.clear();
                }
            }
        }

        self.try_all_db_set(body).await
    }

    /// Remove `key`.
    ///
    /// Not implemented: the store is write-once and keys are never
    /// reclaimed. Succeeds without effect.
    pub async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn get_from_cache(&self, key: &str) -> Result<String> {
        if let Some(fast) = self.fast_cache.get() {
            let url = Tier::Cache.read_url(&fast, key);
            let begin = Instant::now();
            match fetch_value(Arc::clone(&self.transport), key, &url, self.ideal_response).await {
                Ok(value) => {
                    if begin.elapsed() > self.ideal_response {
                        self.fast_cache.clear();
                    }
                    return Ok(value);
                }
                Err(Error::KeyNotFound) => return Err(Error::KeyNotFound),
                Err(err) => {
                    debug!(cache = fast, %err, "fast cache failed");
                    self.fast_cache.clear();
                }
            }
        }

        self.race_get(Tier::Cache, self.caches(), key, Arc::clone(&self.fast_cache))
            .await
    }

    async fn get_from_db(&self, key: &str) -> Result<String> {
        self.race_get(Tier::Db, self.dbs(), key, Arc::clone(&self.fast_db))
            .await
    }

    /// Fan out a read across one tier. The caller gets the first decisive
    /// answer; a detached driver keeps consuming the remaining probes and
    /// promotes the fastest success once all of them finish.
    async fn race_get(
        &self,
        tier: Tier,
        targets: Vec<String>,
        key: &str,
        hint: Arc<FastHint>,
    ) -> Result<String> {
        if targets.is_empty() {
            return Err(Error::Unavailable(tier.kind()));
        }

        let transport = Arc::clone(&self.transport);
        let per_request = self.request_timeout;
        let key_owned = key.to_string();
        let fanout = Fanout::spawn(targets, move |base| {
            let transport = Arc::clone(&transport);
            let url = tier.read_url(&base, &key_owned);
            let key = key_owned.clone();
            async move { fetch_value(transport, &key, &url, per_request).await }
        });

        let (first_tx, first_rx) = oneshot::channel();
        let driver = tokio::spawn(drive_reads(fanout, first_tx, hint));

        match tokio::time::timeout(self.request_timeout, first_rx).await {
            Err(_) => {
                driver.abort();
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(Error::Unavailable(tier.kind())),
            Ok(Ok(result)) => result,
        }
    }

    async fn set_value(&self, db: &str, body: Bytes) -> Result<()> {
        set_value(
            Arc::clone(&self.transport),
            db,
            body,
            self.request_timeout,
        )
        .await
    }

    /// Fan out a write across the database tier: the first success wins and
    /// becomes the new fast DB; a duplicate-key answer is just as decisive.
    /// An expired deadline clears the hint.
    async fn try_all_db_set(&self, body: Bytes) -> Result<()> {
        let dbs = self.dbs();
        if dbs.is_empty() {
            return Err(Error::Unavailable("db"));
        }

        let transport = Arc::clone(&self.transport);
        let per_request = self.request_timeout;
        let body_shared = body.clone();
        let fanout = Fanout::spawn(dbs, move |db| {
            let transport = Arc::clone(&transport);
            let body = body_shared.clone();
            async move { set_value(transport, &db, body, per_request).await }
        });

        let (first_tx, first_rx) = oneshot::channel();
        let hint = Arc::clone(&self.fast_db);
        let driver = tokio::spawn(async move {
            let mut fanout = fanout;
            let mut first = Some(first_tx);
            let mut last_err = None;

            while let Some(probe) = fanout.recv().await {
                match probe.outcome {
                    Ok(()) => {
                        if let Some(tx) = first.take() {
                            hint.set(&probe.url);
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(Error::KeyDuplicate(key)) => {
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Err(Error::KeyDuplicate(key)));
                        }
                    }
                    Err(err) => last_err = Some(err),
                }
            }

            if let Some(tx) = first.take() {
                let _ = tx.send(Err(last_err.unwrap_or(Error::Unavailable("db"))));
            }
        });

        match tokio::time::timeout(self.request_timeout, first_rx).await {
            Err(_) => {
                driver.abort();
                self.fast_db.clear();
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(Error::Unavailable("db")),
            Ok(Ok(result)) => result,
        }
    }
}

/// Consume every probe of a read fan-out: forward the first decisive
/// outcome, then promote the minimum-duration success (or, failing any
/// success, a leader hint seen along the way).
async fn drive_reads(
    mut fanout: Fanout<String>,
    first: oneshot::Sender<Result<String>>,
    hint: Arc<FastHint>,
) {
    let mut first = Some(first);
    let mut best: Option<(String, Duration)> = None;
    let mut leader = None;
    let mut last_err = None;

    while let Some(probe) = fanout.recv().await {
        match probe.outcome {
            Ok(value) => {
                if best.as_ref().map_or(true, |(_, elapsed)| probe.elapsed < *elapsed) {
                    best = Some((probe.url.clone(), probe.elapsed));
                }
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(value));
                }
            }
            Err(Error::KeyNotFound) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(Error::KeyNotFound));
                }
            }
            Err(err) => {
                if let Some(addr) = err.leader_hint() {
                    leader = Some(addr.to_string());
                }
                last_err = Some(err);
            }
        }
    }

    match (best, leader) {
        (Some((url, _)), _) => hint.set(url),
        (None, Some(leader)) => hint.set(leader),
        (None, None) => {}
    }

    if let Some(tx) = first.take() {
        let _ = tx.send(Err(last_err.unwrap_or(Error::Unavailable("endpoint"))));
    }
}

/// Single read against one endpoint, with the response checked against the
/// requested key.
async fn fetch_value(
    transport: Arc<dyn Transport>,
    key: &str,
    url: &str,
    timeout: Duration,
) -> Result<String> {
    let res = tokio::time::timeout(timeout, transport.get(url))
        .await
        .map_err(|_| Error::Timeout)??;

    match res.status {
        200 => {
            let kv: KvBody = res.json()?;
            if kv.key != key {
                return Err(Error::internal(format!(
                    "wrong response for key {key}: got {}",
                    kv.key
                )));
            }
            if kv.value.is_empty() {
                return Err(Error::internal(format!("empty value for key {key}")));
            }
            Ok(kv.value)
        }
        404 => Err(Error::KeyNotFound),
        status => match serde_json::from_slice::<Status>(&res.body).map(Status::into_result) {
            Ok(Err(err)) => Err(err),
            _ => Err(Error::UnexpectedResponse {
                url: url.to_string(),
                status,
            }),
        },
    }
}

/// Single write against one database node.
async fn set_value(
    transport: Arc<dyn Transport>,
    db: &str,
    body: Bytes,
    timeout: Duration,
) -> Result<()> {
    let url = format!("{}/key", normalize_url(db));
    let res = tokio::time::timeout(timeout, transport.post(&url, body))
        .await
        .map_err(|_| Error::Timeout)??;

    if !res.is_ok() {
        // A follower's redirect arrives as HTTP 400 with a status body.
        if let Ok(wire_status) = serde_json::from_slice::<Status>(&res.body) {
            return wire_status.into_result();
        }
        return Err(Error::UnexpectedResponse {
            url,
            status: res.status,
        });
    }

    let wire_status: Status = res.json()?;
    wire_status.into_result()
}
