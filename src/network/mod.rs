//! Connectivity tracking.
//!
//! Raw readings come from a [`NetworkSignal`]; the [`NetworkMonitor`]
//! debounces them and publishes one event per settled transition.

mod monitor;
mod signal;

pub use monitor::{NetworkMonitor, NetworkState, Subscription};
pub use signal::{ChannelSignal, NetworkSignal, ProbeSignal};
