//! Data storage and persistence
//!
//! The pending-transaction pool and the durable chain store (sled with an
//! atomic file fallback).

pub mod memory_pool;
pub mod persistence;

pub use memory_pool::MemoryPool;
pub use persistence::{
    import_snapshot, open_store, ChainStore, FileStore, PeerRecord, SledStore, StateRecord,
    StoreBackend, StoreStats, StoredBlock,
};
