//! # kestrel-vm
//!
//! Hypervisor plumbing for kestrel. Each backend in `kestrel-core` drives one
//! of the machine types here:
//!
//! - [`VirtualMachine`]: a Firecracker process configured over its API socket,
//!   with the guest serial console on the process's stdout.
//! - [`VBoxManage`]: VirtualBox machines registered and controlled through the
//!   `VBoxManage` CLI, with the console on a local server endpoint reached via
//!   [`dial_console`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use kestrel_vm::VmBuilder;
//!
//! # async fn example() -> kestrel_vm::Result<()> {
//! let mut vm = VmBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(256)
//!     .kernel("/path/to/vmlinux")
//!     .rootfs("/path/to/disk.raw")
//!     .launch("demo")
//!     .await?;
//!
//! let _console = vm.take_console();
//! vm.shutdown().await?;
//! let exit = vm.wait().await;
//! println!("guest stopped: {exit}");
//! # Ok(())
//! # }
//! ```

mod api;
mod builder;
mod config;
mod console;
mod error;
mod exit;
mod machine;
mod runner;
mod vbox;

pub use api::ApiClient;
pub use builder::VmBuilder;
pub use config::{generate_mac, DriveConfig, MachineConfig, NetworkConfig, VsockConfig};
pub use console::{console_endpoint, dial_console, dial_console_retry, ConsoleStream};
pub use error::{Result, VmError};
pub use exit::MachineExit;
pub use machine::VirtualMachine;
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use vbox::{
    machine_state_is_alive, ForwardProtocol, PortForward, VBoxMachineSpec, VBoxManage, MAX_NICS,
};
