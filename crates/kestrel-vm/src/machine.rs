//! VirtualMachine type - one running Firecracker process.

use crate::api::ApiClient;
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use crate::exit::MachineExit;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Notify};

/// How long to wait for Firecracker to create its API socket.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between API socket existence checks.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A booted Firecracker guest.
///
/// Each boot is a fresh Firecracker process: the process exits when the guest
/// shuts down, so restarting a machine means launching a new
/// `VirtualMachine` from the same [`MachineConfig`]. The process is owned by a
/// reaper task that publishes the exit status; the guest serial console is the
/// process's stdout and can be taken once with [`take_console`].
///
/// [`take_console`]: VirtualMachine::take_console
pub struct VirtualMachine {
    name: String,
    config: MachineConfig,
    api: ApiClient,
    pid: Option<u32>,
    console: Option<ChildStdout>,
    exit: watch::Receiver<Option<MachineExit>>,
    kill: Arc<Notify>,
}

impl VirtualMachine {
    /// Spawn Firecracker, configure the guest over the API socket and boot it.
    ///
    /// This will:
    /// 1. Spawn the Firecracker process with its API socket in the run directory
    /// 2. Wait for the API socket to appear
    /// 3. Configure machine resources, boot source, drives, interfaces and vsock
    /// 4. Issue `InstanceStart`
    ///
    /// The process is killed if any configuration step fails.
    ///
    /// # Errors
    /// Returns an error if the process cannot be spawned or the guest cannot
    /// be configured and booted.
    pub async fn launch(name: &str, config: MachineConfig) -> Result<Self> {
        config.validate()?;
        let start = Instant::now();
        tracing::info!(vm = %name, vcpus = config.vcpu_count, memory_mib = config.memory_mib, "Launching Firecracker");

        tokio::fs::create_dir_all(&config.run_dir).await?;
        let socket_path = config.socket_path();
        if tokio::fs::try_exists(&socket_path).await.unwrap_or(false) {
            tracing::debug!(socket = %socket_path.display(), "Removing stale API socket");
            tokio::fs::remove_file(&socket_path).await?;
        }

        let mut child = Command::new(&config.firecracker_path)
            .arg("--api-sock")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VmError::Create(format!(
                    "failed to spawn {}: {e}",
                    config.firecracker_path.display()
                ))
            })?;

        let pid = child.id();
        let console = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            let vm = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(vm = %vm, "firecracker: {}", line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        tokio::spawn(reap(name.to_string(), child, exit_tx, Arc::clone(&kill)));

        let vm = Self {
            name: name.to_string(),
            api: ApiClient::new(socket_path),
            config,
            pid,
            console,
            exit: exit_rx,
            kill,
        };

        if let Err(e) = vm.boot().await {
            tracing::error!(vm = %vm.name, error = %e, "Boot failed, killing Firecracker");
            vm.kill().await;
            return Err(e);
        }

        tracing::info!(
            vm = %vm.name,
            pid = ?vm.pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Firecracker guest booted"
        );
        Ok(vm)
    }

    async fn boot(&self) -> Result<()> {
        self.wait_for_socket().await?;

        self.api
            .configure_machine(self.config.vcpu_count, self.config.memory_mib)
            .await?;
        self.api
            .set_boot_source(&self.config.kernel_path, &self.config.boot_args)
            .await?;
        self.api.add_drive(&self.config.root_drive).await?;
        for drive in &self.config.extra_drives {
            self.api.add_drive(drive).await?;
        }
        for iface in &self.config.network {
            tracing::debug!(vm = %self.name, iface = %iface.iface_id, tap = %iface.host_dev_name, "Attaching interface");
            self.api.add_network_interface(iface).await?;
        }
        // vsock must be configured before InstanceStart
        if let Some(vsock) = &self.config.vsock {
            self.api.configure_vsock(vsock).await?;
        }

        self.api
            .instance_start()
            .await
            .map_err(|e| VmError::Start(e.to_string()))
    }

    async fn wait_for_socket(&self) -> Result<()> {
        let deadline = Instant::now() + SOCKET_TIMEOUT;
        loop {
            if tokio::fs::try_exists(self.api.socket_path())
                .await
                .unwrap_or(false)
            {
                return Ok(());
            }
            if let Some(exit) = *self.exit.borrow() {
                return Err(VmError::Create(format!(
                    "firecracker exited before creating its API socket ({exit})"
                )));
            }
            if Instant::now() >= deadline {
                return Err(VmError::Timeout(SOCKET_TIMEOUT));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Name the machine was launched under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process ID of the Firecracker process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Configuration used to launch this machine.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Path to the Firecracker API socket.
    pub fn socket_path(&self) -> &Path {
        self.api.socket_path()
    }

    /// Take the guest serial console stream. Returns `None` after the first call.
    pub fn take_console(&mut self) -> Option<ChildStdout> {
        self.console.take()
    }

    /// Whether the Firecracker process is still running.
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Ask the guest to shut down gracefully.
    ///
    /// Returns once the request is delivered; use [`wait`](Self::wait) to
    /// observe the exit.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running() {
            return Err(VmError::InvalidState {
                expected: "running".into(),
                actual: "exited".into(),
            });
        }
        tracing::info!(vm = %self.name, "Sending Ctrl+Alt+Del");
        self.api
            .send_ctrl_alt_del()
            .await
            .map_err(|e| VmError::Stop(e.to_string()))
    }

    /// Kill the Firecracker process and wait for it to be reaped.
    pub async fn kill(&self) -> MachineExit {
        if self.is_running() {
            tracing::warn!(vm = %self.name, "Force killing Firecracker");
            self.kill.notify_one();
        }
        self.wait().await
    }

    /// Wait for the Firecracker process to exit.
    pub async fn wait(&self) -> MachineExit {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        match result {
            Ok(status) => (*status).unwrap_or_else(MachineExit::unknown),
            Err(_) => MachineExit::unknown(),
        }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill.notify_one();
        }
    }
}

/// Own the child process until it exits, killing it on request.
async fn reap(
    name: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<MachineExit>>,
    kill: Arc<Notify>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.notified() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(vm = %name, error = %e, "Failed to signal Firecracker");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => MachineExit::from(status),
        Err(e) => {
            tracing::error!(vm = %name, error = %e, "Failed to reap Firecracker");
            MachineExit::unknown()
        }
    };
    tracing::debug!(vm = %name, %exit, "Firecracker exited");
    exit_tx.send_replace(Some(exit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_launch_rejects_invalid_config() {
        let mut config = MachineConfig::default();
        config.vcpu_count = 0;
        let result = VirtualMachine::launch("bad", config).await;
        assert!(matches!(result, Err(VmError::Config(_))));
    }

    #[tokio::test]
    async fn test_launch_missing_binary_is_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = MachineConfig {
            firecracker_path: PathBuf::from("/nonexistent/firecracker"),
            run_dir: dir.path().join("vm"),
            ..Default::default()
        };
        let result = VirtualMachine::launch("missing", config).await;
        assert!(matches!(result, Err(VmError::Create(_))));
    }

    #[tokio::test]
    async fn test_process_that_never_creates_socket() {
        // `true` exits immediately without creating an API socket
        let dir = tempfile::tempdir().unwrap();
        let config = MachineConfig {
            firecracker_path: PathBuf::from("true"),
            run_dir: dir.path().join("vm"),
            ..Default::default()
        };
        let result = VirtualMachine::launch("early-exit", config).await;
        assert!(matches!(result, Err(VmError::Create(_))));
    }
}
