//! KivIO Meta - topology metadata store
//!
//! All discovery state lives in a small, strongly consistent, watchable
//! key/value store. Masters write topology through it, nodes and clients
//! read it back, and modify-watches push change notifications.

mod etcd;
mod mem;

pub use etcd::EtcdStore;
pub use mem::MemStore;

use async_trait::async_trait;
use kivio_common::Result;
use tokio::sync::mpsc;

/// The metadata store contract.
///
/// `watch_modify` delivers a unit message after any *modification* of an
/// existing value (creation does not count). Implementations re-subscribe
/// transparently if the underlying watch is canceled; the receiver only
/// closes when the store itself is dropped.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Value at `key`; `Error::KeyNotFound` when absent.
    async fn get(&self, key: &str) -> Result<String>;

    /// Store `value` at `key`, overwriting any previous value.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Subscribe to modifications of `key`.
    fn watch_modify(&self, key: &str) -> mpsc::Receiver<()>;
}
