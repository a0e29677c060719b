//! In-memory metadata store
//!
//! Mutex-guarded map; watch tasks poll for value changes at a fixed period.
//! Intended for tests and single-process development setups.

use crate::MetaStore;
use async_trait::async_trait;
use kivio_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_WATCH_PERIOD: Duration = Duration::from_millis(100);

/// Process-local metadata store.
pub struct MemStore {
    data: Arc<RwLock<HashMap<String, String>>>,
    watch_period: Duration,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            watch_period: DEFAULT_WATCH_PERIOD,
        }
    }

    /// Override the watch polling period.
    #[must_use]
    pub fn with_watch_period(mut self, period: Duration) -> Self {
        self.watch_period = period;
        self
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &str) -> Result<String> {
        self.data.read().get(key).cloned().ok_or(Error::KeyNotFound)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn watch_modify(&self, key: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(16);
        let data = Arc::clone(&self.data);
        let key = key.to_string();
        let period = self.watch_period;

        tokio::spawn(async move {
            let mut last = data.read().get(&key).cloned();
            loop {
                tokio::time::sleep(period).await;

                let current = data.read().get(&key).cloned();
                // A change of an existing value is a modification; the
                // initial creation is not.
                let modified = last.is_some() && current != last;
                last = current;

                if modified && tx.send(()).await.is_err() {
                    return;
                }
            }
        });

        rx
    }
}
