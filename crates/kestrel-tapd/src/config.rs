//! Configuration for the tap helper.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use kestrel_core::tapnet::DEFAULT_HELPER_ADDR;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for `kestrel-tapd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapdConfig {
    /// HTTP listen address. Loopback only in any sane deployment.
    pub addr: SocketAddr,

    /// Bridge every tap device is attached to.
    pub bridge: String,

    /// Run a DHCP responder on the bridge (default: true).
    pub dhcp_enabled: bool,

    /// `dnsmasq` `--dhcp-range` value.
    pub dhcp_range: String,

    /// Path to the `dnsmasq` binary.
    pub dnsmasq_path: PathBuf,
}

impl Default for TapdConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_HELPER_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::LOCALHOST, 7476))),
            bridge: "kestrel0".into(),
            dhcp_enabled: true,
            dhcp_range: "10.77.0.10,10.77.0.250,12h".into(),
            dnsmasq_path: PathBuf::from("/usr/sbin/dnsmasq"),
        }
    }
}

impl TapdConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KESTREL_TAPD_ADDR` | `127.0.0.1:7476` |
    /// | `KESTREL_BRIDGE` | `kestrel0` |
    /// | `KESTREL_DHCP` | `true` |
    /// | `KESTREL_DHCP_RANGE` | `10.77.0.10,10.77.0.250,12h` |
    /// | `KESTREL_DNSMASQ` | `/usr/sbin/dnsmasq` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        Self {
            addr: lookup("KESTREL_TAPD_ADDR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.addr),
            bridge: lookup("KESTREL_BRIDGE")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.bridge),
            dhcp_enabled: lookup("KESTREL_DHCP")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.dhcp_enabled),
            dhcp_range: lookup("KESTREL_DHCP_RANGE")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.dhcp_range),
            dnsmasq_path: lookup("KESTREL_DNSMASQ")
                .map(PathBuf::from)
                .unwrap_or(default.dnsmasq_path),
        }
    }

    /// Log warnings for settings that will likely fail at runtime.
    pub fn validate_warn(&self) {
        if !self.addr.ip().is_loopback() {
            tracing::warn!(addr = %self.addr, "Helper is listening on a non-loopback address");
        }

        if self.dhcp_enabled && !self.dnsmasq_path.exists() {
            tracing::warn!("dnsmasq not found: {:?}", self.dnsmasq_path);
        }

        if self.bridge.len() > 15 {
            tracing::warn!(bridge = %self.bridge, "Bridge name exceeds 15 characters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = TapdConfig::default();
        assert_eq!(config.addr.to_string(), "127.0.0.1:7476");
        assert_eq!(config.bridge, "kestrel0");
        assert!(config.dhcp_enabled);
        assert_eq!(config.dnsmasq_path, PathBuf::from("/usr/sbin/dnsmasq"));
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = TapdConfig::from_lookup(|_| None);
        assert_eq!(config, TapdConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KESTREL_TAPD_ADDR", "127.0.0.1:9000"),
            ("KESTREL_BRIDGE", "br1"),
            ("KESTREL_DHCP", "0"),
            ("KESTREL_DHCP_RANGE", "192.168.50.10,192.168.50.99,1h"),
            ("KESTREL_DNSMASQ", "/opt/dnsmasq"),
        ]
        .into_iter()
        .collect();
        let config = TapdConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.bridge, "br1");
        assert!(!config.dhcp_enabled);
        assert_eq!(config.dhcp_range, "192.168.50.10,192.168.50.99,1h");
        assert_eq!(config.dnsmasq_path, PathBuf::from("/opt/dnsmasq"));
    }

    #[test]
    fn test_bad_addr_falls_back() {
        let config = TapdConfig::from_lookup(|k| {
            (k == "KESTREL_TAPD_ADDR").then(|| "not-an-addr".to_string())
        });
        assert_eq!(config.addr, TapdConfig::default().addr);
    }
}
