//! KivIO Client - the smart client
//!
//! Discovers both tiers through the masters' `Cluster` seam, keeps the
//! member lists fresh on a timer, and remembers the last fast-enough cache
//! and database endpoints. Reads go through the cache tier and fall back to
//! the database tier; writes go straight to the database tier.

mod kv;

use kivio_common::{Cluster, Config, FastHint, Result, Transport};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Client for a KivIO deployment.
pub struct Client {
    db_cluster: Arc<dyn Cluster>,
    cache_cluster: Arc<dyn Cluster>,
    transport: Arc<dyn Transport>,

    dbs: RwLock<Vec<String>>,
    caches: RwLock<Vec<String>>,
    /// Last fast enough cache server URL
    fast_cache: Arc<FastHint>,
    /// Last fast enough database server URL
    fast_db: Arc<FastHint>,

    request_timeout: Duration,
    ideal_response: Duration,
}

impl Client {
    /// Build a client: fetch both member lists synchronously, then keep
    /// them fresh on the configured refresh period.
    pub async fn new(
        db_cluster: Arc<dyn Cluster>,
        cache_cluster: Arc<dyn Cluster>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(Self {
            db_cluster,
            cache_cluster,
            transport,
            dbs: RwLock::new(Vec::new()),
            caches: RwLock::new(Vec::new()),
            fast_cache: Arc::new(FastHint::new()),
            fast_db: Arc::new(FastHint::new()),
            request_timeout: config.request_timeout(),
            ideal_response: config.ideal_response(),
        });

        client.update().await?;

        let weak = Arc::downgrade(&client);
        let period = config.meta_refresh();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else { return };
                if let Err(err) = client.update().await {
                    warn!(%err, "topology refresh failed");
                }
            }
        });

        Ok(client)
    }

    /// Refresh both member lists, replacing the in-memory copies only when
    /// the sorted lists differ.
    pub async fn update(&self) -> Result<()> {
        let mut dbs = self.db_cluster.peers().await?;
        dbs.sort();
        let mut caches = self.cache_cluster.peers().await?;
        caches.sort();

        {
            let current_dbs = self.dbs.read();
            let current_caches = self.caches.read();
            if *current_dbs == dbs && *current_caches == caches {
                return Ok(());
            }
        }

        *self.dbs.write() = dbs;
        *self.caches.write() = caches;
        Ok(())
    }

    /// Current database endpoints, sorted.
    pub fn dbs(&self) -> Vec<String> {
        self.dbs.read().clone()
    }

    /// Current cache endpoints, sorted.
    pub fn caches(&self) -> Vec<String> {
        self.caches.read().clone()
    }
}
