//! Tap device management.
//!
//! [`IpDevices`] shells out to iproute2 and needs `CAP_NET_ADMIN`.
//! [`MemoryDevices`] keeps everything in memory for tests and dry runs.

use crate::error::{Result, TapdError};
use async_trait::async_trait;
use kestrel_vm::{CommandRunner, SystemRunner};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

/// Creates and removes tap devices on a bridge.
#[async_trait]
pub trait TapDevices: Send + Sync {
    /// Fail unless `bridge` exists.
    async fn check_bridge(&self, bridge: &str) -> Result<()>;

    /// Create tap `name`, attach it to `bridge` and bring it up.
    async fn create(&self, name: &str, bridge: &str) -> Result<()>;

    /// Remove tap `name`. Removing a missing device succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Reject names the kernel would refuse or `ip` would misparse.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(TapdError::BadRequest(format!(
            "device name {name:?} must be 1-{MAX_IFNAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(TapdError::BadRequest(format!(
            "device name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Devices managed through `ip`.
#[derive(Clone)]
pub struct IpDevices {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for IpDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpDevices")
            .field("program", &self.program)
            .finish()
    }
}

impl Default for IpDevices {
    fn default() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }
}

impl IpDevices {
    /// Use `ip` from the `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom command runner (tests).
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: PathBuf::from("ip"),
            runner,
        }
    }

    async fn ip(&self, args: &[&str]) -> std::result::Result<(), String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self
            .runner
            .run(&self.program, &args)
            .await
            .map_err(|e| format!("spawn {}: {e}", self.program.display()))?;
        if output.success() {
            Ok(())
        } else {
            let stderr = output.stderr.trim();
            Err(if stderr.is_empty() {
                format!("ip {} failed with {:?}", args.join(" "), output.code)
            } else {
                stderr.to_string()
            })
        }
    }

    async fn exists(&self, name: &str) -> bool {
        self.ip(&["link", "show", "dev", name]).await.is_ok()
    }
}

#[async_trait]
impl TapDevices for IpDevices {
    async fn check_bridge(&self, bridge: &str) -> Result<()> {
        self.ip(&["link", "show", "dev", bridge])
            .await
            .map_err(|message| TapdError::Bridge {
                bridge: bridge.to_string(),
                message,
            })
    }

    async fn create(&self, name: &str, bridge: &str) -> Result<()> {
        let device = |message| TapdError::Device {
            device: name.to_string(),
            message,
        };
        self.ip(&["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .map_err(device)?;

        let attached = match self.ip(&["link", "set", "dev", name, "master", bridge]).await {
            Ok(()) => self.ip(&["link", "set", "dev", name, "up"]).await,
            Err(e) => Err(e),
        };
        if let Err(message) = attached {
            if let Err(e) = self.ip(&["link", "del", "dev", name]).await {
                tracing::warn!(device = %name, error = %e, "Failed to remove half-created tap");
            }
            return Err(device(message));
        }
        tracing::debug!(device = %name, bridge = %bridge, "Tap created");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if !self.exists(name).await {
            tracing::debug!(device = %name, "Tap already gone");
            return Ok(());
        }
        self.ip(&["link", "del", "dev", name])
            .await
            .map_err(|message| TapdError::Device {
                device: name.to_string(),
                message,
            })?;
        tracing::debug!(device = %name, "Tap deleted");
        Ok(())
    }
}

/// In-memory devices.
#[derive(Debug, Default)]
pub struct MemoryDevices {
    bridges: Mutex<BTreeSet<String>>,
    devices: Mutex<BTreeSet<String>>,
    fail_on: Mutex<Option<String>>,
}

impl MemoryDevices {
    /// Devices on the single bridge `bridge`.
    pub fn with_bridge(bridge: &str) -> Self {
        let devices = Self::default();
        devices
            .bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bridge.to_string());
        devices
    }

    /// Make creating `name` fail.
    pub fn fail_on(&self, name: &str) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    /// Names of existing devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TapDevices for MemoryDevices {
    async fn check_bridge(&self, bridge: &str) -> Result<()> {
        if self
            .bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(bridge)
        {
            Ok(())
        } else {
            Err(TapdError::Bridge {
                bridge: bridge.to_string(),
                message: format!("Device \"{bridge}\" does not exist."),
            })
        }
    }

    async fn create(&self, name: &str, _bridge: &str) -> Result<()> {
        let fail = self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(name);
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if fail || devices.contains(name) {
            return Err(TapdError::Device {
                device: name.to_string(),
                message: "File exists".into(),
            });
        }
        devices.insert(name.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}
