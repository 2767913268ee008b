//! Manager and VM configuration types.

use crate::broadcaster::{DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_LEN};
use crate::network::PortProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    /// Delay between liveness checks.
    pub poll_interval: Duration,
    /// Liveness checks after start before the VM is declared broken.
    pub start_attempts: u32,
    /// Liveness checks after a graceful shutdown before escalating to a kill.
    pub stop_attempts: u32,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            start_attempts: 60,
            stop_attempts: 60,
        }
    }
}

impl LifecycleTimings {
    /// Upper bound on how long a start may take to confirm liveness.
    pub fn start_budget(&self) -> Duration {
        self.poll_interval * self.start_attempts
    }

    /// Upper bound on how long a graceful stop may take.
    pub fn stop_budget(&self) -> Duration {
        self.poll_interval * self.stop_attempts
    }

    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            start_attempts: 10,
            stop_attempts: 10,
        }
    }
}

/// Configuration for [`Manager`](crate::Manager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bytes of console history retained per VM (default: 64 KiB).
    pub console_buffer: usize,
    /// Pending console writes queued per subscriber (default: 256).
    pub subscriber_queue: usize,
    /// Start/stop retry budget.
    pub timings: LifecycleTimings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            console_buffer: DEFAULT_BUFFER_SIZE,
            subscriber_queue: DEFAULT_QUEUE_LEN,
            timings: LifecycleTimings::default(),
        }
    }
}

/// A port the guest serves that should be reachable from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Protocol spoken on the port.
    pub protocol: PortProtocol,
    /// Port inside the guest.
    pub port: u16,
}

/// One virtual NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    /// Static IPv4 address, or `dhcp`.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Netmask for a static address.
    #[serde(default)]
    pub mask: Option<String>,
    /// Gateway for a static address.
    #[serde(default)]
    pub gateway: Option<String>,
    /// Ports to expose.
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

fn default_ip() -> String {
    "dhcp".to_string()
}

impl Default for NicConfig {
    fn default() -> Self {
        Self::dhcp()
    }
}

impl NicConfig {
    /// NIC configured by DHCP.
    pub fn dhcp() -> Self {
        Self {
            ip: default_ip(),
            mask: None,
            gateway: None,
            ports: Vec::new(),
        }
    }

    /// NIC with a static address.
    pub fn fixed(ip: impl Into<String>, mask: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mask: Some(mask.into()),
            gateway: Some(gateway.into()),
            ports: Vec::new(),
        }
    }

    /// Expose a guest port.
    pub fn with_port(mut self, protocol: PortProtocol, port: u16) -> Self {
        self.ports.push(PortConfig { protocol, port });
        self
    }
}

/// Machine shape for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// vCPU count (default: 1).
    pub cpus: u8,
    /// Memory in MiB (default: 256).
    pub memory_mib: u32,
    /// Network interfaces in attachment order.
    #[serde(default)]
    pub nics: Vec<NicConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mib: 256,
            nics: Vec::new(),
        }
    }
}

/// Arguments for preparing a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareArgs {
    /// VM name; unique among active VMs.
    pub name: String,
    /// Disk image: a local path or an `http(s)` URL.
    pub disk: String,
    /// Machine shape.
    #[serde(default)]
    pub vm: VmConfig,
    /// Start the VM once prepared.
    #[serde(default)]
    pub start: bool,
}

impl PrepareArgs {
    /// Prepare `name` from `disk` with the default machine shape.
    pub fn new(name: impl Into<String>, disk: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disk: disk.into(),
            vm: VmConfig::default(),
            start: false,
        }
    }

    /// Set the machine shape.
    pub fn vm(mut self, vm: VmConfig) -> Self {
        self.vm = vm;
        self
    }

    /// Start the VM as soon as it is prepared.
    pub fn and_start(mut self) -> Self {
        self.start = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timings_budget() {
        let timings = LifecycleTimings {
            poll_interval: Duration::from_millis(100),
            start_attempts: 10,
            stop_attempts: 5,
        };
        assert_eq!(timings.start_budget(), Duration::from_secs(1));
        assert_eq!(timings.stop_budget(), Duration::from_millis(500));
    }

    #[test]
    fn test_nic_defaults_to_dhcp() {
        let nic: NicConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(nic.ip, "dhcp");
        assert!(nic.ports.is_empty());
    }

    #[test]
    fn test_prepare_args_from_json() {
        let args: PrepareArgs = serde_json::from_str(
            r#"{
                "name": "vm1",
                "disk": "https://example.com/disk.raw",
                "vm": {"cpus": 2, "memory_mib": 512, "nics": [{"ports": [{"protocol": "http", "port": 80}]}]},
                "start": true
            }"#,
        )
        .unwrap();
        assert_eq!(args.name, "vm1");
        assert_eq!(args.vm.cpus, 2);
        assert_eq!(args.vm.nics[0].ports[0].protocol, PortProtocol::Http);
        assert!(args.start);
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.console_buffer, 64 * 1024);
        assert_eq!(config.subscriber_queue, 256);
    }
}
