//! Firecracker backend.
//!
//! Each start launches a fresh Firecracker process from the machine
//! configuration written during preparation. Network interfaces are tap
//! devices obtained from the `kestrel-tapd` helper, attached to its bridge,
//! so guest addresses are reachable from the host directly.

use crate::backend::{Backend, DiskFormat, PrepareContext, Virtualizer};
use crate::broadcaster::Broadcaster;
use crate::disk::{resolve_disk, DiskSource};
use crate::error::{CoreError, Result};
use crate::tapnet::{TapClient, DEFAULT_HELPER_ADDR};
use async_trait::async_trait;
use kestrel_vm::{MachineConfig, MachineExit, VirtualMachine, VmBuilder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Firecracker needs guest memory and disks in whole MiB.
const DISK_ALIGNMENT: u64 = 1 << 20;

/// Virtualizer configuration stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Kernel command line.
    pub boot_args: String,
    /// Parent of the per-VM run directories.
    pub run_dir: PathBuf,
    /// Address of the tap helper.
    pub helper_addr: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        let machine = MachineConfig::default();
        Self {
            firecracker_path: machine.firecracker_path,
            kernel_path: machine.kernel_path,
            boot_args: machine.boot_args,
            run_dir: PathBuf::from("/var/lib/kestrel/firecracker"),
            helper_addr: DEFAULT_HELPER_ADDR.to_string(),
        }
    }
}

impl FirecrackerConfig {
    /// Parse and validate a catalog blob.
    pub fn from_bytes(config: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(config)
            .map_err(|e| CoreError::InvalidConfig(format!("firecracker: {e}")))?;
        config.helper()?;
        if config.kernel_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig(
                "firecracker: kernel_path is required".into(),
            ));
        }
        if config.run_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig(
                "firecracker: run_dir is required".into(),
            ));
        }
        Ok(config)
    }

    fn helper(&self) -> Result<SocketAddr> {
        self.helper_addr.parse().map_err(|e| {
            CoreError::InvalidConfig(format!(
                "firecracker: bad helper_addr {}: {e}",
                self.helper_addr
            ))
        })
    }
}

/// Firecracker micro-VM backend.
#[derive(Debug, Clone)]
pub struct FirecrackerBackend {
    binary: PathBuf,
    kvm: PathBuf,
}

impl Default for FirecrackerBackend {
    fn default() -> Self {
        Self {
            binary: FirecrackerConfig::default().firecracker_path,
            kvm: PathBuf::from("/dev/kvm"),
        }
    }
}

impl FirecrackerBackend {
    /// Backend probing the default Firecracker install.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe for Firecracker at `binary` instead.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl Backend for FirecrackerBackend {
    fn identity(&self) -> &'static str {
        "firecracker"
    }

    fn validate_config(&self, config: &[u8]) -> Result<()> {
        FirecrackerConfig::from_bytes(config).map(|_| ())
    }

    fn disk_alignment(&self) -> u64 {
        DISK_ALIGNMENT
    }

    fn disk_format(&self) -> DiskFormat {
        DiskFormat::Raw
    }

    async fn is_available(&self) -> bool {
        let binary = tokio::fs::try_exists(&self.binary).await.unwrap_or(false);
        let kvm = tokio::fs::try_exists(&self.kvm).await.unwrap_or(false);
        tracing::debug!(binary = %self.binary.display(), found = binary, kvm, "Probed Firecracker");
        binary && kvm
    }

    fn allocate(&self, name: &str) -> Box<dyn Virtualizer> {
        Box::new(FirecrackerVm::new(name))
    }
}

#[derive(Default)]
struct Resources {
    config: Option<FirecrackerConfig>,
    run_dir: Option<PathBuf>,
    disk: Option<PathBuf>,
    devices: Vec<String>,
    machine_config: Option<MachineConfig>,
}

/// One Firecracker VM.
struct FirecrackerVm {
    name: String,
    resources: Mutex<Resources>,
    machine: Mutex<Option<Arc<VirtualMachine>>>,
}

impl FirecrackerVm {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resources: Mutex::new(Resources::default()),
            machine: Mutex::new(None),
        }
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn machine(&self) -> Option<Arc<VirtualMachine>> {
        self.machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn config(&self) -> Result<FirecrackerConfig> {
        self.resources()
            .config
            .clone()
            .ok_or_else(|| CoreError::InvalidConfig("firecracker: not initialized".into()))
    }
}

/// Tap device prefix for a handle; `<prefix>-<n>` stays within the
/// 15-byte Linux interface name limit.
fn tap_id(id: uuid::Uuid) -> String {
    let hex = id.simple().to_string();
    format!("kt{}", &hex[..8])
}

/// Derive a stable MAC seed from the handle id.
fn mac_seed(id: uuid::Uuid) -> u32 {
    (id.as_u128() & 0xffff) as u32
}

async fn write_machine_config(run_dir: &Path, config: &MachineConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(run_dir.join("machine.json"), json).await?;
    Ok(())
}

#[async_trait]
impl Virtualizer for FirecrackerVm {
    async fn initialize(&self, config: &[u8]) -> Result<()> {
        let config = FirecrackerConfig::from_bytes(config)?;
        self.resources().config = Some(config);
        Ok(())
    }

    async fn prepare(&self, ctx: PrepareContext<'_>) -> Result<()> {
        let config = self.config()?;
        let run_dir = config.run_dir.join(ctx.name);
        tokio::fs::create_dir_all(&run_dir).await?;
        self.resources().run_dir = Some(run_dir.clone());
        ctx.progress.log(format!("run directory {}", run_dir.display()));

        let disk = resolve_disk(
            &DiskSource::parse(&ctx.args.disk),
            &run_dir,
            DISK_ALIGNMENT,
            ctx.progress,
        )
        .await?;
        self.resources().disk = Some(disk.clone());

        let nics = ctx.args.vm.nics.len();
        let devices = if nics > 0 {
            ctx.progress.status("provisioning network devices");
            let client = TapClient::new(config.helper()?);
            client.create(&tap_id(ctx.id), nics).await?
        } else {
            Vec::new()
        };
        self.resources().devices = devices.clone();

        let seed = mac_seed(ctx.id);
        let mut builder = VmBuilder::new()
            .vcpus(ctx.args.vm.cpus)
            .memory_mib(ctx.args.vm.memory_mib)
            .kernel(&config.kernel_path)
            .boot_args(&config.boot_args)
            .rootfs(&disk)
            .firecracker_path(&config.firecracker_path)
            .run_dir(&run_dir);
        for (index, device) in devices.iter().enumerate() {
            ctx.routes.set_device(index, device.clone());
            builder = builder.tap(device, seed);
        }
        ctx.routes.fill_direct_routes();

        let machine_config = builder.into_config();
        machine_config.validate()?;
        write_machine_config(&run_dir, &machine_config).await?;
        self.resources().machine_config = Some(machine_config);

        ctx.progress.log("machine configuration written");
        Ok(())
    }

    async fn start(&self, console: &Broadcaster) -> Result<()> {
        let config = self
            .resources()
            .machine_config
            .clone()
            .ok_or_else(|| CoreError::Provisioning("firecracker: VM not prepared".into()))?;

        let mut vm = VirtualMachine::launch(&self.name, config).await?;
        if let Some(stdout) = vm.take_console() {
            let console = console.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                match console.copy_from(stdout).await {
                    Ok(bytes) => tracing::debug!(vm = %name, bytes, "Console stream ended"),
                    Err(e) => tracing::warn!(vm = %name, error = %e, "Console stream failed"),
                }
            });
        }
        *self.machine.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(vm));
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(self.machine().is_some_and(|vm| vm.is_running()))
    }

    async fn shutdown(&self) -> Result<()> {
        match self.machine() {
            Some(vm) if vm.is_running() => Ok(vm.shutdown().await?),
            _ => Ok(()),
        }
    }

    async fn kill(&self) -> Result<()> {
        if let Some(vm) = self.machine() {
            let exit = vm.kill().await;
            tracing::debug!(vm = %self.name, %exit, "Firecracker killed");
        }
        Ok(())
    }

    async fn wait(&self) -> Result<MachineExit> {
        match self.machine() {
            Some(vm) => Ok(vm.wait().await),
            None => Ok(MachineExit::unknown()),
        }
    }

    async fn release(&self) -> Result<()> {
        self.kill().await?;
        self.machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let (config, devices, run_dir) = {
            let mut resources = self.resources();
            (
                resources.config.clone(),
                std::mem::take(&mut resources.devices),
                resources.run_dir.take(),
            )
        };

        let mut first_error = None;
        if !devices.is_empty() {
            let result = match config.as_ref().map(FirecrackerConfig::helper) {
                Some(Ok(addr)) => TapClient::new(addr).delete(&devices).await,
                Some(Err(e)) => Err(e),
                None => Err(CoreError::InvalidConfig(
                    "firecracker: not initialized".into(),
                )),
            };
            if let Err(e) = result {
                tracing::warn!(vm = %self.name, devices = ?devices, error = %e, "Failed to delete tap devices");
                first_error = Some(e);
            }
        }

        if let Some(run_dir) = run_dir {
            match tokio::fs::remove_dir_all(&run_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(vm = %self.name, dir = %run_dir.display(), error = %e, "Failed to remove run directory");
                    first_error.get_or_insert(CoreError::Io(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn disk_path(&self) -> Option<PathBuf> {
        self.resources().disk.clone()
    }

    fn direct_routes(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleTimings, NicConfig, PrepareArgs, VmConfig};
    use crate::handle::Handle;
    use crate::state::VmState;

    fn config_json(run_dir: &Path, helper: &str) -> Vec<u8> {
        serde_json::to_vec(&FirecrackerConfig {
            firecracker_path: PathBuf::from("/nonexistent/firecracker"),
            kernel_path: PathBuf::from("/var/lib/kestrel/vmlinux"),
            run_dir: run_dir.to_path_buf(),
            helper_addr: helper.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_config() {
        let backend = FirecrackerBackend::new();
        assert!(backend.validate_config(b"{}").is_ok());
        assert!(backend
            .validate_config(br#"{"helper_addr": "not an address"}"#)
            .is_err());
        assert!(backend.validate_config(br#"{"kernel_path": ""}"#).is_err());
        assert!(backend.validate_config(b"[]").is_err());
    }

    #[test]
    fn test_backend_constants() {
        let backend = FirecrackerBackend::new();
        assert_eq!(backend.identity(), "firecracker");
        assert_eq!(backend.disk_format(), DiskFormat::Raw);
        assert_eq!(backend.disk_alignment(), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_unavailable_without_binary() {
        let backend = FirecrackerBackend::new().with_binary("/nonexistent/firecracker");
        assert!(!backend.is_available().await);
    }

    #[tokio::test]
    async fn test_prepare_without_nics_writes_machine_config() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.raw");
        std::fs::write(&disk, vec![0u8; 1 << 20]).unwrap();
        let runs = dir.path().join("runs");

        let handle = Handle::standalone(
            "fc1",
            FirecrackerBackend::new().allocate("fc1"),
            LifecycleTimings::fast(),
        );
        handle
            .initialize(&config_json(&runs, "127.0.0.1:7476"))
            .await
            .unwrap();
        handle
            .prepare(PrepareArgs::new("fc1", disk.to_string_lossy()))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let written: MachineConfig =
            serde_json::from_slice(&std::fs::read(runs.join("fc1/machine.json")).unwrap())
                .unwrap();
        assert_eq!(written.root_drive.path_on_host, disk);
        assert_eq!(written.run_dir, runs.join("fc1"));
        assert!(written.network.is_empty());

        handle.close(true).await.unwrap();
        assert!(!runs.join("fc1").exists());
        assert!(disk.exists());
    }

    #[tokio::test]
    async fn test_prepare_fails_without_helper() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.raw");
        std::fs::write(&disk, vec![0u8; 1 << 20]).unwrap();
        let runs = dir.path().join("runs");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let helper = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handle = Handle::standalone(
            "fc2",
            FirecrackerBackend::new().allocate("fc2"),
            LifecycleTimings::fast(),
        );
        handle.initialize(&config_json(&runs, &helper)).await.unwrap();
        let args = PrepareArgs::new("fc2", disk.to_string_lossy()).vm(VmConfig {
            nics: vec![NicConfig::dhcp()],
            ..Default::default()
        });

        let err = handle.prepare(args).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, CoreError::HelperUnavailable { .. }));
        assert_eq!(handle.state(), VmState::Deleted);
        assert!(!runs.join("fc2").exists());
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.raw");
        std::fs::write(&disk, vec![0u8; 1 << 20]).unwrap();

        let handle = Handle::standalone(
            "fc3",
            FirecrackerBackend::new().allocate("fc3"),
            LifecycleTimings::fast(),
        );
        handle
            .initialize(&config_json(&dir.path().join("runs"), "127.0.0.1:7476"))
            .await
            .unwrap();
        handle
            .prepare(PrepareArgs::new("fc3", disk.to_string_lossy()))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(handle.start().await.is_err());
        assert_eq!(handle.state(), VmState::Broken);
    }

    #[test]
    fn test_tap_id_fits_interface_names() {
        let id = uuid::Uuid::new_v4();
        let name = format!("{}-7", tap_id(id));
        assert!(name.len() <= 15);
        assert!(name.starts_with("kt"));
    }

    #[test]
    fn test_mac_seed_is_stable() {
        let id = uuid::Uuid::from_u128(0x1234_5678);
        assert_eq!(mac_seed(id), 0x5678);
    }
}
