//! KivIO Cache - the cache tier
//!
//! Cache nodes form a partitioned in-memory cache in front of the database
//! tier: keys are spread across peers by consistent hashing, misses are
//! loaded from the fastest known database node, and the cache master pushes
//! topology to every node by heartbeat.

mod group;
mod lru;
mod master;
mod node;
mod pool;
mod ring;

pub use group::{Group, Loader};
pub use lru::ByteCache;
pub use master::CacheMaster;
pub use node::CacheNode;
pub use pool::PeerPool;
pub use ring::HashRing;
