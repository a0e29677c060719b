//! etcd-backed metadata store

use crate::MetaStore;
use async_trait::async_trait;
use etcd_client::{Client, EventType};
use kivio_common::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pause before re-subscribing after a canceled or failed watch.
const REWATCH_BACKOFF: Duration = Duration::from_millis(500);

/// Metadata store backed by an etcd v3 cluster.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the given etcd endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::meta(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String> {
        let mut client = self.client.clone();
        let res = client
            .get(key, None)
            .await
            .map_err(|e| Error::meta(e.to_string()))?;

        match res.kvs().first() {
            Some(kv) => Ok(kv
                .value_str()
                .map_err(|e| Error::meta(e.to_string()))?
                .to_string()),
            None => Err(Error::KeyNotFound),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, "meta put");
        let mut client = self.client.clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| Error::meta(e.to_string()))?;
        Ok(())
    }

    fn watch_modify(&self, key: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                let mut client = client.clone();
                let (_watcher, mut stream) = match client.watch(key.as_str(), None).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(key, %err, "etcd watch failed, re-subscribing");
                        tokio::time::sleep(REWATCH_BACKOFF).await;
                        continue;
                    }
                };

                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                debug!(key, "etcd watch canceled, re-subscribing");
                                break;
                            }

                            // A kv at version 1 was just created; anything
                            // beyond that is a modification.
                            let modified = resp.events().iter().any(|ev| {
                                ev.event_type() == EventType::Put
                                    && ev.kv().map(|kv| kv.version() > 1).unwrap_or(false)
                            });

                            if modified && tx.send(()).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(key, %err, "etcd watch stream error, re-subscribing");
                            break;
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(REWATCH_BACKOFF).await;
            }
        });

        rx
    }
}
