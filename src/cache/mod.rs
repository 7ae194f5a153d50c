//! Versioned response cache used by the fetch interceptor.
//!
//! This module provides:
//! - Named cache generations, one current generation per namespace
//! - Network-first and cache-first strategies that always produce a response
//! - SQLite storage for responses that must survive restarts

mod layer;
#[cfg(test)]
mod memory;
mod storage;
mod traits;

pub use layer::CacheLayer;
#[cfg(test)]
pub use memory::MemoryCacheStorage;
pub use storage::{CacheStorage, CacheStorageError, SqliteCacheStorage};
pub use traits::{CacheNamespace, CacheResult, CacheSource, CacheVersion};
