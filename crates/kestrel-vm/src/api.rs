//! Firecracker API socket client.
//!
//! Every configuration step before boot is a `PUT` of a JSON document to the
//! machine's API socket. Machine resources and vsock bodies come from
//! `firepilot_models`; drives and interfaces serialize straight from our
//! config types.

use crate::config::{DriveConfig, NetworkConfig, VsockConfig};
use crate::error::{Result, VmError};
use firepilot_models::models::{MachineConfiguration, Vsock};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// `PUT /boot-source` body.
#[derive(Debug, Serialize)]
struct BootSource<'a> {
    kernel_image_path: String,
    boot_args: &'a str,
}

/// `PUT /actions` body.
#[derive(Debug, Serialize)]
struct InstanceAction {
    action_type: &'static str,
}

/// Thin client for one Firecracker API socket.
#[derive(Debug, Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
}

impl ApiClient {
    /// Create a client for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Path of the API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Configure vCPU count and memory. Must be called before boot.
    pub async fn configure_machine(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");
        let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
        self.put("/machine-config", &config).await
    }

    /// Set the kernel image and its command line.
    pub async fn set_boot_source(&self, kernel: &Path, boot_args: &str) -> Result<()> {
        let body = BootSource {
            kernel_image_path: kernel.to_string_lossy().to_string(),
            boot_args,
        };
        self.put("/boot-source", &body).await
    }

    /// Attach a block device.
    pub async fn add_drive(&self, drive: &DriveConfig) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    /// Attach a network interface backed by a host tap device.
    pub async fn add_network_interface(&self, iface: &NetworkConfig) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    /// Configure the vsock device.
    pub async fn configure_vsock(&self, config: &VsockConfig) -> Result<()> {
        tracing::debug!(
            cid = config.guest_cid,
            uds_path = %config.uds_path.display(),
            "Configuring vsock"
        );
        let vsock = Vsock::new(
            config.guest_cid as i32,
            config.uds_path.to_string_lossy().to_string(),
        );
        self.put("/vsock", &vsock).await
    }

    /// Boot the configured guest.
    pub async fn instance_start(&self) -> Result<()> {
        self.action("InstanceStart").await
    }

    /// Ask the guest to shut down through the emulated keyboard controller.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.action("SendCtrlAltDel").await
    }

    async fn action(&self, action_type: &'static str) -> Result<()> {
        self.put("/actions", &InstanceAction { action_type }).await
    }

    async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        let body = serde_json::to_string(body)
            .map_err(|e| VmError::Config(format!("failed to serialize {endpoint} body: {e}")))?;
        tracing::trace!(endpoint, body = %body, "Firecracker API request");

        let uri: hyper::Uri = Uri::new(&self.socket_path, endpoint).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))
            .map_err(|e| VmError::Api(format!("failed to build {endpoint} request: {e}")))?;

        let client = Client::unix();
        let response = client
            .request(request)
            .await
            .map_err(|e| VmError::Api(format!("{endpoint} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            let body_str = String::from_utf8_lossy(&body_bytes);
            tracing::error!(endpoint, status = %status, body = %body_str, "Firecracker API call failed");
            return Err(VmError::Api(format!(
                "{endpoint} failed with status {status}: {body_str}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_serialization() {
        let config = MachineConfiguration::new(256, 2);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mem_size_mib\":256"));
        assert!(json.contains("\"vcpu_count\":2"));
    }

    #[test]
    fn test_boot_source_serialization() {
        let body = BootSource {
            kernel_image_path: "/k/vmlinux".into(),
            boot_args: "console=ttyS0",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"kernel_image_path":"/k/vmlinux","boot_args":"console=ttyS0"}"#
        );
    }

    #[test]
    fn test_action_serialization() {
        let json = serde_json::to_string(&InstanceAction {
            action_type: "SendCtrlAltDel",
        })
        .unwrap();
        assert_eq!(json, r#"{"action_type":"SendCtrlAltDel"}"#);
    }

    #[tokio::test]
    async fn test_put_without_socket_is_api_error() {
        let client = ApiClient::new("/nonexistent/kestrel/firecracker.socket");
        let err = client.instance_start().await.unwrap_err();
        assert!(matches!(err, VmError::Api(_)));
    }
}
