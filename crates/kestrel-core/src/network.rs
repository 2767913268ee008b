//! Per-VM network route table and DHCP lease back-fill.

use crate::broadcaster::Subscription;
use crate::config::NicConfig;
use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Protocol of an exposed guest port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// Raw TCP
    Tcp,
    /// Raw UDP
    Udp,
    /// HTTP over TCP
    Http,
    /// HTTPS over TCP
    Https,
}

impl PortProtocol {
    /// Whether the protocol runs over UDP.
    pub fn is_udp(&self) -> bool {
        matches!(self, Self::Udp)
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// An exposed guest port and where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Protocol spoken on the port.
    pub protocol: PortProtocol,
    /// Port inside the guest.
    pub port: u16,
    /// `host:port` the service is reachable at, once known.
    pub external: Option<String>,
}

/// One configured NIC and its current addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicRoute {
    /// Interface index (`eth{index}` in the guest).
    pub index: usize,
    /// Host device backing the NIC, once provisioned.
    pub device: Option<String>,
    /// Address: static, `dhcp`, or the leased address once reported.
    pub ip: String,
    /// Netmask.
    pub mask: Option<String>,
    /// Gateway.
    pub gateway: Option<String>,
    /// Exposed ports.
    pub ports: Vec<PortMapping>,
    /// Whether the address is obtained by DHCP.
    pub dhcp: bool,
}

impl NicRoute {
    fn from_config(index: usize, nic: &NicConfig) -> Self {
        let dhcp = nic.ip.eq_ignore_ascii_case("dhcp");
        Self {
            index,
            device: None,
            ip: nic.ip.clone(),
            mask: nic.mask.clone(),
            gateway: nic.gateway.clone(),
            ports: nic
                .ports
                .iter()
                .map(|p| PortMapping {
                    protocol: p.protocol,
                    port: p.port,
                    external: None,
                })
                .collect(),
            dhcp,
        }
    }

    /// Whether the NIC has a concrete address.
    pub fn has_address(&self) -> bool {
        !self.ip.eq_ignore_ascii_case("dhcp")
    }

    fn fill_direct_routes(&mut self) {
        if !self.has_address() {
            return;
        }
        for mapping in &mut self.ports {
            if mapping.external.is_none() {
                mapping.external = Some(format!("{}:{}", self.ip, mapping.port));
            }
        }
    }
}

/// Route table shared between a handle, its backend and the lease watcher.
#[derive(Debug, Clone, Default)]
pub struct NetworkRoutes {
    nics: Arc<RwLock<Vec<NicRoute>>>,
}

impl NetworkRoutes {
    /// Routes for freshly configured NICs.
    pub fn from_config(nics: &[NicConfig]) -> Self {
        let routes = nics
            .iter()
            .enumerate()
            .map(|(i, nic)| NicRoute::from_config(i, nic))
            .collect();
        Self {
            nics: Arc::new(RwLock::new(routes)),
        }
    }

    /// Replace the table with routes for `nics`.
    pub fn configure(&self, nics: &[NicConfig]) {
        let routes: Vec<NicRoute> = nics
            .iter()
            .enumerate()
            .map(|(i, nic)| NicRoute::from_config(i, nic))
            .collect();
        *self.nics.write().unwrap_or_else(PoisonError::into_inner) = routes;
    }

    /// Copy of the current table.
    pub fn snapshot(&self) -> Vec<NicRoute> {
        self.nics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of NICs.
    pub fn len(&self) -> usize {
        self.nics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when the VM has no NICs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any NIC still waits for a DHCP lease.
    pub fn awaiting_lease(&self) -> bool {
        self.nics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|nic| nic.dhcp && !nic.has_address())
    }

    fn update<F, T>(&self, index: usize, f: F) -> Option<T>
    where
        F: FnOnce(&mut NicRoute) -> T,
    {
        let mut nics = self.nics.write().unwrap_or_else(PoisonError::into_inner);
        nics.get_mut(index).map(f)
    }

    /// Record the host device backing NIC `index`.
    pub fn set_device(&self, index: usize, device: impl Into<String>) {
        let device = device.into();
        self.update(index, |nic| nic.device = Some(device));
    }

    /// Record where mapping `port` of NIC `index` is reachable.
    pub fn set_external(&self, index: usize, port: usize, external: impl Into<String>) {
        let external = external.into();
        self.update(index, |nic| {
            if let Some(mapping) = nic.ports.get_mut(port) {
                mapping.external = Some(external);
            }
        });
    }

    /// Fill `host:port` routes for NICs whose guest address is directly
    /// reachable from the host.
    pub fn fill_direct_routes(&self) {
        let mut nics = self.nics.write().unwrap_or_else(PoisonError::into_inner);
        for nic in nics.iter_mut() {
            nic.fill_direct_routes();
        }
    }

    /// Apply a lease reported by the guest.
    ///
    /// Only NICs configured for DHCP are updated. Returns whether anything changed.
    pub fn apply_lease(&self, lease: &DhcpLease, direct: bool) -> bool {
        self.update(lease.iface, |nic| {
            if !nic.dhcp || nic.ip == lease.ip {
                return false;
            }
            nic.ip = lease.ip.clone();
            if lease.mask.is_some() {
                nic.mask = lease.mask.clone();
            }
            if lease.gateway.is_some() {
                nic.gateway = lease.gateway.clone();
            }
            if direct {
                for mapping in &mut nic.ports {
                    mapping.external = None;
                }
                nic.fill_direct_routes();
            }
            true
        })
        .unwrap_or(false)
    }
}

/// Address a guest reported for one of its interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Interface index.
    pub iface: usize,
    /// Leased address.
    pub ip: String,
    /// Leased netmask.
    pub mask: Option<String>,
    /// Leased gateway.
    pub gateway: Option<String>,
}

/// Recognizes `eth<N> ip: <a.b.c.d> [mask: <m>] [gateway: <g>]` console lines.
#[derive(Debug, Clone)]
pub struct LeaseParser {
    pattern: Regex,
}

const LEASE_PATTERN: &str = r"eth(\d+)\s+ip:\s*(\d{1,3}(?:\.\d{1,3}){3})(?:\s+mask:\s*(\d{1,3}(?:\.\d{1,3}){3}))?(?:\s+gateway:\s*(\d{1,3}(?:\.\d{1,3}){3}))?";

impl LeaseParser {
    /// Compile the lease pattern.
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(LEASE_PATTERN)
            .map_err(|e| CoreError::InvalidConfig(format!("lease pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Parse one console line.
    pub fn parse(&self, line: &str) -> Option<DhcpLease> {
        let caps = self.pattern.captures(line)?;
        let iface = caps.get(1)?.as_str().parse().ok()?;
        Some(DhcpLease {
            iface,
            ip: caps.get(2)?.as_str().to_string(),
            mask: caps.get(3).map(|m| m.as_str().to_string()),
            gateway: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }
}

/// Follow console output and back-fill DHCP routes until the console closes.
///
/// `direct` marks backends whose guest addresses are reachable from the host,
/// so leased addresses also become the external route of every exposed port.
pub async fn watch_leases(
    vm: String,
    mut console: Subscription,
    routes: NetworkRoutes,
    direct: bool,
) -> Result<()> {
    let parser = LeaseParser::new()?;
    let mut pending = Vec::new();

    while let Some(chunk) = console.recv().await {
        pending.extend_from_slice(&chunk);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(lease) = parser.parse(line.trim_end()) {
                if routes.apply_lease(&lease, direct) {
                    tracing::info!(vm = %vm, iface = lease.iface, ip = %lease.ip, "Guest reported DHCP lease");
                }
            }
        }
        // Guard against a console that never emits newlines
        if pending.len() > 4096 {
            pending.clear();
        }
    }
    tracing::debug!(vm = %vm, "Lease watcher stopped");
    Ok(())
}
