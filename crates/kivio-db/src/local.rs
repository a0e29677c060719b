//! redb-backed local store
//!
//! Single-node [`Store`] backend: it is always the leader of its own
//! cluster and `join` only records the joining address. A replicated Raft
//! backend plugs in through the same trait.

use crate::store::Store;
use async_trait::async_trait;
use kivio_common::{Error, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

/// Local write-once key/value store.
pub struct LocalStore {
    raft_addr: String,
    dir: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    peers: RwLock<BTreeSet<String>>,
    single: RwLock<bool>,
    gets: AtomicU64,
    adds: AtomicU64,
}

impl LocalStore {
    /// Create an unopened store rooted at `dir`.
    pub fn new(raft_addr: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            raft_addr: raft_addr.into(),
            dir: dir.into(),
            db: RwLock::new(None),
            peers: RwLock::new(BTreeSet::new()),
            single: RwLock::new(true),
            gets: AtomicU64::new(0),
            adds: AtomicU64::new(0),
        }
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| Error::storage("store is not open"))
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn open(&self, single: bool) -> Result<()> {
        let dir = self.dir.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            std::fs::create_dir_all(&dir).map_err(|e| Error::storage(e.to_string()))?;
            let db = Database::create(dir.join("kv.redb"))
                .map_err(|e| Error::storage(e.to_string()))?;

            // Make sure the table exists so reads never race its creation.
            let txn = db
                .begin_write()
                .map_err(|e| Error::storage(e.to_string()))?;
            txn.open_table(KV_TABLE)
                .map_err(|e| Error::storage(e.to_string()))?;
            txn.commit().map_err(|e| Error::storage(e.to_string()))?;

            Ok(db)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

        *self.db.write() = Some(Arc::new(db));
        *self.single.write() = single;
        self.peers.write().insert(self.raft_addr.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let db = self.database()?;
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<String> {
            let txn = db
                .begin_read()
                .map_err(|e| Error::storage(e.to_string()))?;
            let table = txn
                .open_table(KV_TABLE)
                .map_err(|e| Error::storage(e.to_string()))?;
            match table
                .get(key.as_str())
                .map_err(|e| Error::storage(e.to_string()))?
            {
                Some(guard) => Ok(guard.value().to_string()),
                None => Err(Error::KeyNotFound),
            }
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }

    async fn add(&self, key: &str, value: &str) -> Result<()> {
        self.adds.fetch_add(1, Ordering::Relaxed);
        let db = self.database()?;
        let key = key.to_string();
        let value = value.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db
                .begin_write()
                .map_err(|e| Error::storage(e.to_string()))?;
            {
                let mut table = txn
                    .open_table(KV_TABLE)
                    .map_err(|e| Error::storage(e.to_string()))?;

                // The duplicate check and the insert share one write
                // transaction, so concurrent adds of the same new key
                // resolve to exactly one winner.
                if table
                    .get(key.as_str())
                    .map_err(|e| Error::storage(e.to_string()))?
                    .is_some()
                {
                    return Err(Error::KeyDuplicate(key));
                }

                table
                    .insert(key.as_str(), value.as_str())
                    .map_err(|e| Error::storage(e.to_string()))?;
            }
            txn.commit().map_err(|e| Error::storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }

    async fn join(&self, raft_addr: &str) -> Result<()> {
        self.peers.write().insert(raft_addr.to_string());
        Ok(())
    }

    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self.peers.read().iter().cloned().collect())
    }

    fn leader(&self) -> String {
        if self.db.read().is_some() {
            self.raft_addr.clone()
        } else {
            String::new()
        }
    }

    fn stats(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        let state = if *self.single.read() { "single" } else { "follower" };
        stats.insert("state".to_string(), state.to_string());
        stats.insert("leader".to_string(), self.leader());
        stats.insert(
            "peers".to_string(),
            self.peers.read().len().to_string(),
        );
        stats.insert(
            "gets".to_string(),
            self.gets.load(Ordering::Relaxed).to_string(),
        );
        stats.insert(
            "adds".to_string(),
            self.adds.load(Ordering::Relaxed).to_string(),
        );
        stats
    }
}
