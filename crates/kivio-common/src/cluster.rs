//! Cluster discovery seam
//!
//! The client only needs "who are the members of this tier right now"; it
//! must not depend on the master implementations themselves. Both masters
//! implement this trait, and tests substitute fixed lists.

use crate::error::Result;
use async_trait::async_trait;

/// A source of member addresses for one tier.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Current member addresses.
    async fn peers(&self) -> Result<Vec<String>>;
}

/// Fixed member list, for tests and static wiring.
pub struct StaticCluster {
    peers: Vec<String>,
}

impl StaticCluster {
    pub fn new(peers: Vec<String>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self.peers.clone())
    }
}
