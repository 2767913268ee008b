//! Privileged network-device provisioning.
//!
//! Creating tap devices needs root, so backends ask the `kestrel-tapd` helper
//! over loopback HTTP instead of doing it themselves. [`protocol`] holds the
//! wire types both sides share; [`TapClient`] is the orchestrator's side.

mod client;
pub mod protocol;

pub use client::{TapClient, DEFAULT_TIMEOUT};
pub use protocol::{device_names, DEFAULT_HELPER_ADDR};
