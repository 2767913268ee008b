//! # kestrel-tapd
//!
//! Privileged helper that creates tap devices for kestrel VMs.
//!
//! Backends run unprivileged and ask this helper over loopback HTTP for one
//! tap device per guest NIC. The helper attaches every device to a single
//! bridge and, optionally, runs a DHCP responder on that bridge so guests
//! configured for `dhcp` get an address.
//!
//! ## Usage
//!
//! ```bash
//! # Create the bridge once
//! ip link add kestrel0 type bridge
//! ip addr add 10.77.0.1/16 dev kestrel0
//! ip link set kestrel0 up
//!
//! # Run the helper
//! sudo kestrel-tapd
//!
//! # Or with a custom bridge and no DHCP
//! sudo KESTREL_BRIDGE=br0 KESTREL_DHCP=false kestrel-tapd
//! ```
//!
//! The wire format is shared with the client in
//! [`kestrel_core::tapnet::protocol`].

pub mod config;
pub mod devices;
pub mod dhcp;
pub mod error;
pub mod server;

pub use config::TapdConfig;
pub use devices::{IpDevices, MemoryDevices, TapDevices};
pub use dhcp::DhcpConfig;
pub use error::{Result, TapdError};
pub use server::{build_router, serve, AppState};
