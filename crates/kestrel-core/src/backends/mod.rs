//! Hypervisor backends shipped with kestrel.

mod firecracker;
mod virtualbox;

#[cfg(test)]
pub(crate) mod fake;

pub use firecracker::{FirecrackerBackend, FirecrackerConfig};
pub use virtualbox::{VirtualBoxBackend, VirtualBoxConfig};
