//! KivIO DB - the database tier
//!
//! A database node is a Raft-replicated key/value replica: writes are
//! linearized through the leader and keys are write-once. This crate covers
//! the coordination surface: the [`Store`] contract the replication backend
//! fulfills, the node's HTTP service, and the [`DbMaster`] that tracks
//! membership through the metadata store and evicts unreachable nodes.

mod local;
mod master;
mod service;
mod store;

pub use local::LocalStore;
pub use master::DbMaster;
pub use service::DbService;
pub use store::Store;
