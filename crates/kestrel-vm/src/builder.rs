//! Chained construction of a [`MachineConfig`].

use crate::config::{MachineConfig, NetworkConfig};
use crate::error::Result;
use crate::VirtualMachine;
use std::path::PathBuf;

/// Assembles a [`MachineConfig`] one setting at a time.
///
/// Tap devices are numbered in the order they are added, so the first
/// becomes `eth0` in the guest.
///
/// ```no_run
/// use kestrel_vm::VmBuilder;
///
/// # async fn example() -> kestrel_vm::Result<()> {
/// let vm = VmBuilder::new()
///     .vcpus(2)
///     .memory_mib(512)
///     .kernel("/var/lib/kestrel/vmlinux")
///     .rootfs("/var/lib/kestrel/guest.raw")
///     .tap("kt1a2b3c4d-0", 7)
///     .launch("guest")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VmBuilder {
    config: MachineConfig,
}

impl VmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Uncompressed guest kernel.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Raw disk image the guest boots from.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    /// Back the next guest interface with `device`. The MAC is derived from
    /// `mac_seed` and the interface position, so it is stable across boots.
    pub fn tap(mut self, device: &str, mac_seed: u32) -> Self {
        let index = self.config.network.len();
        self.config
            .network
            .push(NetworkConfig::for_tap(index, device, mac_seed));
        self
    }

    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Directory for the API socket and other per-run files.
    pub fn run_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.run_dir = path.into();
        self
    }

    pub fn into_config(self) -> MachineConfig {
        self.config
    }

    /// Spawn Firecracker with the assembled configuration.
    pub async fn launch(self, name: &str) -> Result<VirtualMachine> {
        VirtualMachine::launch(name, self.config).await
    }
}
