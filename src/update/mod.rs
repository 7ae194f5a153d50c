//! Rolling the cache manager forward to a new version.
//!
//! The runtime hosts the active and waiting workers; the coordinator is the
//! page's half of the handshake.

mod coordinator;
mod runtime;

pub use coordinator::{Reloader, UpdateAction, UpdateCoordinator, UpdatePrompt};
pub use runtime::{spawn_runtime, ClientEvent, RegisterOutcome, RuntimeHandle};
