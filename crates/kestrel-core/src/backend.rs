//! Backend abstraction.
//!
//! A [`Backend`] describes a hypervisor kestrel can drive and hands out one
//! [`Virtualizer`] per VM. The virtualizer is the backend-specific half of a
//! [`Handle`](crate::Handle): the handle owns the lifecycle, the virtualizer
//! owns the hypervisor resources.

use crate::broadcaster::Broadcaster;
use crate::config::PrepareArgs;
use crate::error::Result;
use crate::network::NetworkRoutes;
use crate::operation::Progress;
use async_trait::async_trait;
use kestrel_vm::MachineExit;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// On-disk image format a backend boots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Flat raw image
    Raw,
    /// VMware/VirtualBox disk
    Vmdk,
}

impl DiskFormat {
    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Vmdk => "vmdk",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Everything a virtualizer needs while preparing.
pub struct PrepareContext<'a> {
    /// Handle id.
    pub id: Uuid,
    /// VM name.
    pub name: &'a str,
    /// Caller's arguments.
    pub args: &'a PrepareArgs,
    /// Route table to fill in.
    pub routes: &'a NetworkRoutes,
    /// Reporting channel of the operation.
    pub progress: &'a Progress,
}

/// A hypervisor kestrel can drive.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity, used as the catalog's backend name.
    fn identity(&self) -> &'static str;

    /// Check an opaque virtualizer configuration before it is stored.
    fn validate_config(&self, config: &[u8]) -> Result<()>;

    /// Disk sizes should be a multiple of this many bytes.
    fn disk_alignment(&self) -> u64;

    /// Image format the backend boots.
    fn disk_format(&self) -> DiskFormat;

    /// Whether the hypervisor can run on this host.
    async fn is_available(&self) -> bool;

    /// Fresh backend state for the VM `name`.
    fn allocate(&self, name: &str) -> Box<dyn Virtualizer>;
}

/// Backend-specific capabilities behind one VM handle.
///
/// Methods take `&self` and may be called concurrently: [`wait`](Self::wait)
/// runs in the exit watcher while the lifecycle issues shutdowns and liveness
/// checks.
#[async_trait]
pub trait Virtualizer: Send + Sync {
    /// Apply the catalog configuration.
    async fn initialize(&self, config: &[u8]) -> Result<()>;

    /// Acquire every resource the VM needs: disk, network devices, machine definition.
    async fn prepare(&self, ctx: PrepareContext<'_>) -> Result<()>;

    /// Power the machine on and pump its console into `console`.
    async fn start(&self, console: &Broadcaster) -> Result<()>;

    /// Whether the guest is running.
    async fn is_alive(&self) -> Result<bool>;

    /// Request a graceful guest shutdown.
    async fn shutdown(&self) -> Result<()>;

    /// Stop the machine immediately.
    async fn kill(&self) -> Result<()>;

    /// Wait for the current run of the machine to end.
    async fn wait(&self) -> Result<MachineExit>;

    /// Release every resource acquired by [`prepare`](Self::prepare).
    ///
    /// Must tolerate partially prepared state and repeated calls.
    async fn release(&self) -> Result<()>;

    /// Disk image backing the VM, once prepared.
    fn disk_path(&self) -> Option<PathBuf>;

    /// Whether guest addresses are reachable directly from the host.
    fn direct_routes(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_format_display() {
        assert_eq!(DiskFormat::Raw.to_string(), "raw");
        assert_eq!(
            serde_json::to_string(&DiskFormat::Vmdk).unwrap(),
            "\"vmdk\""
        );
    }
}
