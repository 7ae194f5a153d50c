//! The cache manager: a versioned background agent that precaches the app
//! shell, evicts old cache generations and answers intercepted fetches.

mod actor;
mod manager;

pub use actor::{spawn_worker, WorkerEvent, WorkerHandle, WorkerMessage};
pub use manager::{
  CacheManager, FetchOutcome, InstallReport, Manifest, WorkerError, WorkerSettings, WorkerState,
};
