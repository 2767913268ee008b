//! VirtualBox backend.
//!
//! Machines are registered through `VBoxManage` with one NAT adapter per
//! NIC. Guest ports are published on host loopback ports picked at
//! preparation time, and the serial console is a local server endpoint the
//! backend dials after power-on.

use crate::backend::{Backend, DiskFormat, PrepareContext, Virtualizer};
use crate::broadcaster::Broadcaster;
use crate::disk::{resolve_disk, DiskSource};
use crate::error::{CoreError, Result};
use crate::network::PortProtocol;
use async_trait::async_trait;
use kestrel_vm::{
    console_endpoint, dial_console_retry, machine_state_is_alive, CommandRunner, ForwardProtocol, MachineExit,
    PortForward, SystemRunner, VBoxMachineSpec, VBoxManage, MAX_NICS,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DISK_ALIGNMENT: u64 = 2 << 20;
const CONSOLE_DIAL_INTERVAL: Duration = Duration::from_millis(250);
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive `showvminfo` failures tolerated while waiting for an exit.
const MAX_POLL_FAILURES: u32 = 5;

/// Virtualizer configuration stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualBoxConfig {
    /// `VBoxManage` binary.
    pub vboxmanage_path: PathBuf,
    /// Parent of the per-VM machine folders.
    pub run_dir: PathBuf,
    /// Start machines without a GUI window.
    pub headless: bool,
    /// How often to try reaching the serial console after power-on.
    pub console_attempts: u32,
}

impl Default for VirtualBoxConfig {
    fn default() -> Self {
        Self {
            vboxmanage_path: PathBuf::from("VBoxManage"),
            run_dir: PathBuf::from("/var/lib/kestrel/virtualbox"),
            headless: true,
            console_attempts: 40,
        }
    }
}

impl VirtualBoxConfig {
    /// Parse and validate a catalog blob.
    pub fn from_bytes(config: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(config)
            .map_err(|e| CoreError::InvalidConfig(format!("virtualbox: {e}")))?;
        if config.vboxmanage_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig(
                "virtualbox: vboxmanage_path is required".into(),
            ));
        }
        if config.run_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig(
                "virtualbox: run_dir is required".into(),
            ));
        }
        Ok(config)
    }
}

/// VirtualBox backend.
#[derive(Clone)]
pub struct VirtualBoxBackend {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for VirtualBoxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBoxBackend")
            .field("program", &self.program)
            .finish()
    }
}

impl Default for VirtualBoxBackend {
    fn default() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }
}

impl VirtualBoxBackend {
    /// Backend running the real `VBoxManage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend issuing commands through `runner`.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: VirtualBoxConfig::default().vboxmanage_path,
            runner,
        }
    }

    /// Probe `program` instead of `VBoxManage` on the `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl Backend for VirtualBoxBackend {
    fn identity(&self) -> &'static str {
        "virtualbox"
    }

    fn validate_config(&self, config: &[u8]) -> Result<()> {
        VirtualBoxConfig::from_bytes(config).map(|_| ())
    }

    fn disk_alignment(&self) -> u64 {
        DISK_ALIGNMENT
    }

    fn disk_format(&self) -> DiskFormat {
        DiskFormat::Vmdk
    }

    async fn is_available(&self) -> bool {
        let manage = VBoxManage::with_runner(&self.program, Arc::clone(&self.runner));
        match manage.version().await {
            Ok(version) => {
                tracing::debug!(%version, "Found VirtualBox");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "VirtualBox not available");
                false
            }
        }
    }

    fn allocate(&self, name: &str) -> Box<dyn Virtualizer> {
        Box::new(VirtualBoxVm {
            name: name.to_string(),
            runner: Arc::clone(&self.runner),
            inner: Mutex::new(Inner::default()),
        })
    }
}

#[derive(Default)]
struct Inner {
    config: Option<VirtualBoxConfig>,
    manage: Option<VBoxManage>,
    run_dir: Option<PathBuf>,
    disk: Option<PathBuf>,
    console: Option<PathBuf>,
    registered: bool,
}

struct VirtualBoxVm {
    name: String,
    runner: Arc<dyn CommandRunner>,
    inner: Mutex<Inner>,
}

impl VirtualBoxVm {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn manage(&self) -> Result<VBoxManage> {
        self.inner()
            .manage
            .clone()
            .ok_or_else(|| CoreError::InvalidConfig("virtualbox: not initialized".into()))
    }

    /// The manager, if the machine is registered with VirtualBox.
    fn registered(&self) -> Option<VBoxManage> {
        let inner = self.inner();
        if inner.registered {
            inner.manage.clone()
        } else {
            None
        }
    }
}

/// Reserve a free host loopback port for `protocol`.
fn free_host_port(protocol: PortProtocol) -> Result<u16> {
    let addr = (Ipv4Addr::LOCALHOST, 0);
    let port = if protocol.is_udp() {
        UdpSocket::bind(addr)?.local_addr()?.port()
    } else {
        TcpListener::bind(addr)?.local_addr()?.port()
    };
    Ok(port)
}

fn forward_protocol(protocol: PortProtocol) -> ForwardProtocol {
    if protocol.is_udp() {
        ForwardProtocol::Udp
    } else {
        ForwardProtocol::Tcp
    }
}

#[async_trait]
impl Virtualizer for VirtualBoxVm {
    async fn initialize(&self, config: &[u8]) -> Result<()> {
        let config = VirtualBoxConfig::from_bytes(config)?;
        let manage = VBoxManage::with_runner(&config.vboxmanage_path, Arc::clone(&self.runner));
        let mut inner = self.inner();
        inner.config = Some(config);
        inner.manage = Some(manage);
        Ok(())
    }

    async fn prepare(&self, ctx: PrepareContext<'_>) -> Result<()> {
        let manage = self.manage()?;
        let config = self
            .inner()
            .config
            .clone()
            .ok_or_else(|| CoreError::InvalidConfig("virtualbox: not initialized".into()))?;

        let nics = &ctx.args.vm.nics;
        if nics.len() > MAX_NICS {
            return Err(CoreError::InvalidConfig(format!(
                "virtualbox supports at most {MAX_NICS} NICs, got {}",
                nics.len()
            )));
        }

        let run_dir = config.run_dir.join(ctx.name);
        tokio::fs::create_dir_all(&run_dir).await?;
        self.inner().run_dir = Some(run_dir.clone());

        let source = DiskSource::parse(&ctx.args.disk);
        let mut disk = resolve_disk(&source, &run_dir, DISK_ALIGNMENT, ctx.progress).await?;
        // Unregistering deletes attached media, so never attach the caller's file.
        if let DiskSource::Local(original) = &source {
            let file_name = original
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("disk.{}", DiskFormat::Vmdk)));
            let copy = run_dir.join(file_name);
            ctx.progress.status("copying disk");
            tokio::fs::copy(&disk, &copy).await?;
            disk = copy;
        }
        self.inner().disk = Some(disk.clone());

        let mut adapters = Vec::with_capacity(nics.len());
        let mut externals = Vec::new();
        for (index, nic) in nics.iter().enumerate() {
            let mut forwards = Vec::with_capacity(nic.ports.len());
            for (port_index, port) in nic.ports.iter().enumerate() {
                let host_port = free_host_port(port.protocol)?;
                forwards.push(PortForward {
                    protocol: forward_protocol(port.protocol),
                    host_port,
                    guest_port: port.port,
                });
                externals.push((index, port_index, format!("127.0.0.1:{host_port}")));
            }
            adapters.push(forwards);
        }

        let console = console_endpoint(&run_dir, ctx.name);
        let spec = VBoxMachineSpec {
            name: ctx.name.to_string(),
            base_folder: run_dir.clone(),
            cpus: ctx.args.vm.cpus,
            memory_mib: ctx.args.vm.memory_mib,
            disk: disk.clone(),
            console: console.clone(),
            nics: adapters,
        };
        ctx.progress.status("registering machine");
        manage.create(&spec).await?;
        {
            let mut inner = self.inner();
            inner.registered = true;
            inner.console = Some(console);
        }

        for index in 0..nics.len() {
            ctx.routes.set_device(index, format!("nat{}", index + 1));
        }
        for (index, port_index, external) in externals {
            ctx.routes.set_external(index, port_index, external);
        }
        ctx.progress.log(format!("machine {} registered", ctx.name));
        Ok(())
    }

    async fn start(&self, console: &Broadcaster) -> Result<()> {
        let manage = self
            .registered()
            .ok_or_else(|| CoreError::Provisioning("virtualbox: VM not prepared".into()))?;
        let (config, endpoint) = {
            let inner = self.inner();
            (inner.config.clone().unwrap_or_default(), inner.console.clone())
        };

        manage.start(&self.name, config.headless).await?;

        let Some(endpoint) = endpoint else {
            return Ok(());
        };
        match dial_console_retry(&endpoint, config.console_attempts, CONSOLE_DIAL_INTERVAL).await {
            Ok(stream) => {
                let console = console.clone();
                let name = self.name.clone();
                tokio::spawn(async move {
                    match console.copy_from(stream).await {
                        Ok(bytes) => tracing::debug!(vm = %name, bytes, "Console stream ended"),
                        Err(e) => tracing::warn!(vm = %name, error = %e, "Console stream failed"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(vm = %self.name, endpoint = %endpoint.display(), error = %e, "Console unavailable");
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool> {
        match self.registered() {
            Some(manage) => Ok(manage.is_running(&self.name).await?),
            None => Ok(false),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match self.registered() {
            Some(manage) => Ok(manage.acpi_power_button(&self.name).await?),
            None => Ok(()),
        }
    }

    async fn kill(&self) -> Result<()> {
        let Some(manage) = self.registered() else {
            return Ok(());
        };
        if manage.is_running(&self.name).await? {
            manage.power_off(&self.name).await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<MachineExit> {
        let Some(manage) = self.registered() else {
            return Ok(MachineExit::unknown());
        };
        let mut failures = 0;
        let state = loop {
            match manage.state(&self.name).await {
                Ok(state) if !machine_state_is_alive(&state) => break state,
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_POLL_FAILURES {
                        return Err(e.into());
                    }
                    tracing::debug!(vm = %self.name, failures, error = %e, "Machine state query failed");
                }
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        };
        if state == "poweroff" {
            Ok(MachineExit::with_code(0))
        } else {
            tracing::debug!(vm = %self.name, %state, "Machine stopped abnormally");
            Ok(MachineExit::unknown())
        }
    }

    async fn release(&self) -> Result<()> {
        let mut first_error = None;
        if let Err(e) = self.kill().await {
            tracing::warn!(vm = %self.name, error = %e, "Failed to power off machine");
            first_error = Some(e);
        }

        if let Some(manage) = self.registered() {
            match manage.unregister(&self.name).await {
                Ok(()) => self.inner().registered = false,
                Err(e) => {
                    tracing::warn!(vm = %self.name, error = %e, "Failed to unregister machine");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        let run_dir = self.inner().run_dir.take();
        if let Some(run_dir) = run_dir {
            match tokio::fs::remove_dir_all(&run_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(vm = %self.name, dir = %run_dir.display(), error = %e, "Failed to remove machine folder");
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
        self.inner().disk.clone()
    }
}
