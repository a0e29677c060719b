//! Store contract for the database node
//!
//! The replication algorithm itself is a collaborator behind this trait:
//! `add` is linearizable on the leader, reads are leader-served, and the
//! coordination plane only relies on the operations below.

use async_trait::async_trait;
use kivio_common::Result;
use std::collections::HashMap;

/// The interface Raft-backed key/value stores must implement.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open the store, either bootstrapping a new single-node cluster or
    /// joining an existing one as a follower.
    async fn open(&self, single: bool) -> Result<()>;

    /// Value for `key`; `Error::KeyNotFound` when absent.
    async fn get(&self, key: &str) -> Result<String>;

    /// Add `key`/`value` via distributed consensus.
    ///
    /// Keys are write-once: adding an existing key fails with
    /// `Error::KeyDuplicate` and never overwrites.
    async fn add(&self, key: &str, value: &str) -> Result<()>;

    /// Join the node reachable at `raft_addr` to the cluster.
    async fn join(&self, raft_addr: &str) -> Result<()>;

    /// Raft addresses of the current cluster members.
    async fn peers(&self) -> Result<Vec<String>>;

    /// Raft address of the current leader; empty while unknown.
    fn leader(&self) -> String;

    /// Status counters, served as the liveness probe.
    fn stats(&self) -> HashMap<String, String>;
}
