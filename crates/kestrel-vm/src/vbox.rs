//! VirtualBox machines driven through `VBoxManage`.

use crate::error::{Result, VmError};
use crate::runner::{CommandOutput, CommandRunner, SystemRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage controller every kestrel machine gets.
const STORAGE_CONTROLLER: &str = "SATA";

/// VirtualBox supports up to eight network adapters per machine.
pub const MAX_NICS: usize = 8;

/// Transport protocol of a NAT port-forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Host-loopback port forwarded into the guest through NAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub protocol: ForwardProtocol,
    pub host_port: u16,
    pub guest_port: u16,
}

impl PortForward {
    /// `--natpfN` rule text: `name,proto,hostip,hostport,guestip,guestport`.
    fn rule(&self) -> String {
        format!(
            "{}-{},{},127.0.0.1,{},,{}",
            self.protocol, self.host_port, self.protocol, self.host_port, self.guest_port
        )
    }
}

/// Everything needed to register a machine with VirtualBox.
#[derive(Debug, Clone)]
pub struct VBoxMachineSpec {
    /// Machine name, unique within VirtualBox.
    pub name: String,
    /// Directory VirtualBox keeps the machine's files in.
    pub base_folder: PathBuf,
    pub cpus: u8,
    pub memory_mib: u32,
    /// Boot disk, attached to the first SATA port.
    pub disk: PathBuf,
    /// Server endpoint for the first serial port.
    pub console: PathBuf,
    /// One NAT adapter per entry, each with its port forwards.
    pub nics: Vec<Vec<PortForward>>,
}

/// `VBoxManage` front end.
#[derive(Clone)]
pub struct VBoxManage {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for VBoxManage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBoxManage")
            .field("program", &self.program)
            .finish()
    }
}

impl VBoxManage {
    /// Use the `VBoxManage` binary at `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_runner(program, Arc::new(SystemRunner))
    }

    /// Use a custom command runner (tests).
    pub fn with_runner(program: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    /// Path of the `VBoxManage` binary.
    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn exec<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let output = self.runner.run(&self.program, &args).await?;
        if !output.success() {
            return Err(VmError::Command {
                program: self.program.display().to_string(),
                args: args.join(" "),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Installed VirtualBox version.
    pub async fn version(&self) -> Result<String> {
        let output = self.exec(["--version"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Register a new machine and attach its disk, console and adapters.
    ///
    /// Either every step succeeds or the machine is unregistered again.
    pub async fn create(&self, spec: &VBoxMachineSpec) -> Result<()> {
        if spec.nics.len() > MAX_NICS {
            return Err(VmError::Config(format!(
                "VirtualBox supports at most {MAX_NICS} network adapters, got {}",
                spec.nics.len()
            )));
        }
        tracing::info!(vm = %spec.name, "Registering VirtualBox machine");

        self.exec([
            "createvm".to_string(),
            "--name".into(),
            spec.name.clone(),
            "--basefolder".into(),
            spec.base_folder.display().to_string(),
            "--ostype".into(),
            "Linux_64".into(),
            "--register".into(),
        ])
        .await?;

        if let Err(e) = self.configure(spec).await {
            tracing::warn!(vm = %spec.name, error = %e, "Machine setup failed, unregistering");
            if let Err(cleanup) = self.unregister(&spec.name).await {
                tracing::warn!(vm = %spec.name, error = %cleanup, "Failed to unregister half-created machine");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn configure(&self, spec: &VBoxMachineSpec) -> Result<()> {
        self.exec(modify_args(spec)).await?;

        self.exec([
            "storagectl",
            spec.name.as_str(),
            "--name",
            STORAGE_CONTROLLER,
            "--add",
            "sata",
            "--portcount",
            "1",
        ])
        .await?;

        self.exec([
            "storageattach".to_string(),
            spec.name.clone(),
            "--storagectl".into(),
            STORAGE_CONTROLLER.into(),
            "--port".into(),
            "0".into(),
            "--device".into(),
            "0".into(),
            "--type".into(),
            "hdd".into(),
            "--medium".into(),
            spec.disk.display().to_string(),
        ])
        .await?;

        Ok(())
    }

    /// Power the machine on, without a GUI when `headless` is set.
    pub async fn start(&self, name: &str, headless: bool) -> Result<()> {
        let kind = if headless { "headless" } else { "gui" };
        self.exec(["startvm", name, "--type", kind])
            .await
            .map(|_| ())
            .map_err(|e| VmError::Start(e.to_string()))
    }

    /// Current `VMState` as reported by `showvminfo`.
    pub async fn state(&self, name: &str) -> Result<String> {
        let output = self.exec(["showvminfo", name, "--machinereadable"]).await?;
        parse_machine_state(&output.stdout).ok_or_else(|| {
            VmError::InvalidState {
                expected: "VMState in showvminfo output".into(),
                actual: "missing".into(),
            }
        })
    }

    /// Whether the machine is powered on in any form.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(machine_state_is_alive(&self.state(name).await?))
    }

    /// Press the virtual ACPI power button.
    pub async fn acpi_power_button(&self, name: &str) -> Result<()> {
        self.exec(["controlvm", name, "acpipowerbutton"])
            .await
            .map(|_| ())
            .map_err(|e| VmError::Stop(e.to_string()))
    }

    /// Pull the virtual power cord.
    pub async fn power_off(&self, name: &str) -> Result<()> {
        self.exec(["controlvm", name, "poweroff"])
            .await
            .map(|_| ())
            .map_err(|e| VmError::Stop(e.to_string()))
    }

    /// Unregister the machine and delete its files.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        tracing::info!(vm = %name, "Unregistering VirtualBox machine");
        self.exec(["unregistervm", name, "--delete"]).await.map(|_| ())
    }
}

fn modify_args(spec: &VBoxMachineSpec) -> Vec<String> {
    let mut args = vec![
        "modifyvm".to_string(),
        spec.name.clone(),
        "--cpus".into(),
        spec.cpus.to_string(),
        "--memory".into(),
        spec.memory_mib.to_string(),
        "--ioapic".into(),
        "on".into(),
        "--uart1".into(),
        "0x3F8".into(),
        "4".into(),
        "--uartmode1".into(),
        "server".into(),
        spec.console.display().to_string(),
    ];

    for (i, forwards) in spec.nics.iter().enumerate() {
        let n = i + 1;
        args.push(format!("--nic{n}"));
        args.push("nat".into());
        for forward in forwards {
            args.push(format!("--natpf{n}"));
            args.push(forward.rule());
        }
    }
    args
}

/// Extract `VMState="..."` from `showvminfo --machinereadable` output.
pub fn parse_machine_state(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("VMState=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

/// States in which the guest is (or is about to be) executing.
pub fn machine_state_is_alive(state: &str) -> bool {
    matches!(
        state,
        "running" | "paused" | "starting" | "stopping" | "restoring" | "saving"
    )
}
