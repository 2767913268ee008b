//! # kestrel-core
//!
//! VM lifecycle control plane for kestrel.
//!
//! This crate turns a hypervisor backend into named, long-lived VMs with a
//! uniform lifecycle, a replayable console stream and resolved network
//! routes. Hypervisor specifics live behind the [`Backend`] and
//! [`Virtualizer`] traits; everything else is shared.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    kestrel-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Manager      │────▶│  Catalog                 │   │
//! │  │  - prepare()    │     │  (virtualizer configs)   │   │
//! │  │  - get()        │     └──────────────────────────┘   │
//! │  │  - close()      │     ┌──────────────────────────┐   │
//! │  └─────────────────┘────▶│  ActiveRegistry          │   │
//! │           │              │  name -> Handle          │   │
//! │           ▼              └──────────────────────────┘   │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Handle       │────▶│  Virtualizer             │   │
//! │  │  - start()      │     │  (firecracker/virtualbox)│   │
//! │  │  - stop()       │     └──────────────────────────┘   │
//! │  │  - console()    │                │ serial            │
//! │  └─────────────────┘                ▼                   │
//! │           │              ┌──────────────────────────┐   │
//! │  ┌─────────────────┐     │  Broadcaster             │   │
//! │  │  Operation      │     │  ring buffer + fan-out   │   │
//! │  │  logs / status  │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │ HTTP
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                kestrel-tapd (privileged)                 │
//! │          tap devices on the host bridge + DHCP           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kestrel_core::{FirecrackerBackend, Manager, ManagerConfig, PrepareArgs};
//! use std::sync::Arc;
//!
//! # async fn example() -> kestrel_core::Result<()> {
//! let manager = Manager::new(ManagerConfig::default());
//! manager.register_backend(Arc::new(FirecrackerBackend::new())).await;
//! manager
//!     .create_virtualizer("fc", "firecracker", br#"{"kernel_path": "/var/lib/kestrel/vmlinux"}"#)
//!     .await?;
//!
//! let operation = manager
//!     .prepare("fc", PrepareArgs::new("web", "/images/web.raw").and_start())
//!     .await?;
//! let handle = operation.wait().await?;
//!
//! let mut console = handle.console().subscribe();
//! while let Some(chunk) = console.recv().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//!
//! manager.close("web", false).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod backends;
mod broadcaster;
mod catalog;
mod config;
mod disk;
mod error;
mod handle;
mod manager;
mod network;
mod operation;
mod registry;
mod state;
pub mod tapnet;

pub use backend::{Backend, DiskFormat, PrepareContext, Virtualizer};
pub use backends::{FirecrackerBackend, FirecrackerConfig, VirtualBoxBackend, VirtualBoxConfig};
pub use broadcaster::{Broadcaster, Subscription, DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_LEN};
pub use catalog::{Catalog, CatalogEntry, MemoryCatalog};
pub use config::{LifecycleTimings, ManagerConfig, NicConfig, PortConfig, PrepareArgs, VmConfig};
pub use disk::{resolve_disk, DiskSource};
pub use error::{CoreError, Result};
pub use handle::{Handle, HandleDetails};
pub use manager::Manager;
pub use network::{
    watch_leases, DhcpLease, LeaseParser, NetworkRoutes, NicRoute, PortMapping, PortProtocol,
};
pub use operation::{Operation, Progress};
pub use registry::ActiveRegistry;
pub use state::VmState;
