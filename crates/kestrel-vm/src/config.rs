//! Configuration types for Firecracker machines.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for launching a Firecracker machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of virtual CPUs (1-32)
    pub vcpu_count: u8,
    /// Memory size in MiB (128-32768)
    pub memory_mib: u32,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Root filesystem drive
    pub root_drive: DriveConfig,
    /// Additional drives (optional)
    pub extra_drives: Vec<DriveConfig>,
    /// Network interfaces, attached in order
    pub network: Vec<NetworkConfig>,
    /// vsock configuration for guest-host communication (optional)
    pub vsock: Option<VsockConfig>,
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Directory holding the API socket and other per-machine state
    pub run_dir: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            memory_mib: 256,
            kernel_path: PathBuf::from("/var/lib/kestrel/vmlinux"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            root_drive: DriveConfig::default(),
            extra_drives: Vec::new(),
            network: Vec::new(),
            vsock: None,
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            run_dir: PathBuf::from("/tmp/kestrel"),
        }
    }
}

impl MachineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Firecracker supports 1-32 vCPUs
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }

        if self.memory_mib < 128 {
            return Err(VmError::Config(format!(
                "memory_mib must be at least 128, got {}",
                self.memory_mib
            )));
        }

        // CIDs 0, 1 and 2 are reserved
        if let Some(vsock) = &self.vsock {
            if vsock.guest_cid <= 2 {
                return Err(VmError::Config(format!(
                    "vsock guest_cid must be > 2, got {}",
                    vsock.guest_cid
                )));
            }
        }

        let mut drive_ids = vec![self.root_drive.drive_id.as_str()];
        for extra in &self.extra_drives {
            if drive_ids.contains(&extra.drive_id.as_str()) {
                return Err(VmError::Config(format!(
                    "duplicate drive_id: {}",
                    extra.drive_id
                )));
            }
            drive_ids.push(&extra.drive_id);
        }

        let mut iface_ids: Vec<&str> = Vec::with_capacity(self.network.len());
        for iface in &self.network {
            if iface.host_dev_name.is_empty() {
                return Err(VmError::Config(format!(
                    "interface {} has no host device",
                    iface.iface_id
                )));
            }
            if iface_ids.contains(&iface.iface_id.as_str()) {
                return Err(VmError::Config(format!(
                    "duplicate iface_id: {}",
                    iface.iface_id
                )));
            }
            iface_ids.push(&iface.iface_id);
        }

        Ok(())
    }

    /// Path of the Firecracker API socket inside the run directory.
    pub fn socket_path(&self) -> PathBuf {
        self.run_dir.join("firecracker.socket")
    }
}

/// Configuration for a block device (drive).
///
/// Serializes directly into the body of `PUT /drives/{drive_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image on host
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::from("/var/lib/kestrel/images/disk.raw"),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
///
/// Serializes directly into the body of `PUT /network-interfaces/{iface_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network interface ID
    pub iface_id: String,
    /// Host device name (tap device)
    pub host_dev_name: String,
    /// Guest MAC address (Firecracker generates one if None)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            iface_id: "eth0".into(),
            host_dev_name: "tap0".into(),
            guest_mac: None,
        }
    }
}

impl NetworkConfig {
    /// Interface `eth{index}` backed by the given tap device, with a
    /// deterministic locally-administered MAC.
    pub fn for_tap(index: usize, host_dev_name: impl Into<String>, seed: u32) -> Self {
        Self {
            iface_id: format!("eth{index}"),
            host_dev_name: host_dev_name.into(),
            guest_mac: Some(generate_mac(seed, index)),
        }
    }
}

/// vsock configuration for guest-host communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest CID (Context ID), must be > 2
    pub guest_cid: u32,
    /// Path to vsock Unix Domain Socket on host
    pub uds_path: PathBuf,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            guest_cid: 3,
            uds_path: PathBuf::from("/tmp/kestrel-vsock.sock"),
        }
    }
}

impl VsockConfig {
    /// Create a vsock config whose socket lives in the machine's run directory.
    pub fn in_run_dir(cid: u32, run_dir: &Path) -> Self {
        Self {
            guest_cid: cid,
            uds_path: run_dir.join("v.sock"),
        }
    }
}

/// Generate a locally-administered MAC address.
///
/// Format: `52:54:00:{seed_high}:{seed_low}:{index}`
pub fn generate_mac(seed: u32, index: usize) -> String {
    let high = (seed >> 8) as u8;
    let low = (seed & 0xff) as u8;
    format!("52:54:00:{high:02x}:{low:02x}:{:02x}", index as u8)
}
