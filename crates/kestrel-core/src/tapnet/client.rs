//! Client for the `kestrel-tapd` helper.

use super::protocol::{
    device_names, CreateRequest, CreateResponse, DeleteRequest, ErrorBody, DEFAULT_HELPER_ADDR,
};
use crate::error::{CoreError, Result};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Upper bound on one helper round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the privileged helper over loopback HTTP.
#[derive(Debug, Clone)]
pub struct TapClient {
    addr: SocketAddr,
    timeout: Duration,
    client: Client<HttpConnector>,
}

impl Default for TapClient {
    fn default() -> Self {
        let addr = DEFAULT_HELPER_ADDR
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7476)));
        Self::new(addr)
    }
}

impl TapClient {
    /// Client for the helper at `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
            client: Client::new(),
        }
    }

    /// Override the round-trip timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Helper address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Create `count` tap devices for VM `id`.
    ///
    /// # Errors
    /// Fails with [`CoreError::HelperUnavailable`] when the helper cannot be
    /// reached and [`CoreError::Provisioning`] when it answers with devices
    /// other than `<id>-0` .. `<id>-<count - 1>`.
    pub async fn create(&self, id: &str, count: usize) -> Result<Vec<String>> {
        tracing::debug!(vm = %id, count, helper = %self.addr, "Requesting tap devices");
        let request = CreateRequest {
            id: id.to_string(),
            count,
        };
        let body = self.send(Method::POST, &request).await?;
        let response: CreateResponse = serde_json::from_slice(&body)?;

        if response.devices != device_names(id, count) {
            return Err(CoreError::Provisioning(format!(
                "helper returned devices {:?} for {count} interfaces of {id}",
                response.devices
            )));
        }
        tracing::info!(vm = %id, devices = ?response.devices, "Tap devices created");
        Ok(response.devices)
    }

    /// Remove tap devices. Devices that no longer exist are ignored by the helper.
    pub async fn delete(&self, devices: &[String]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }
        tracing::debug!(devices = ?devices, helper = %self.addr, "Deleting tap devices");
        let request = DeleteRequest {
            devices: devices.to_vec(),
        };
        self.send(Method::DELETE, &request).await?;
        Ok(())
    }

    async fn send<T: Serialize>(&self, method: Method, body: &T) -> Result<bytes::Bytes> {
        let body = serde_json::to_vec(body)?;
        let request = Request::builder()
            .method(method.clone())
            .uri(format!("http://{}/", self.addr))
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|e| CoreError::Provisioning(format!("failed to build helper request: {e}")))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| CoreError::Timeout(self.timeout))?
            .map_err(|e| CoreError::HelperUnavailable {
                addr: self.addr,
                reason: e.to_string(),
            })?;

        let status = response.status();
        let bytes = tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| CoreError::Timeout(self.timeout))?
            .map_err(|e| CoreError::Provisioning(format!("failed to read helper response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            tracing::warn!(method = %method, status = %status, error = %message, "Helper request failed");
            return Err(CoreError::Helper {
                status: status.as_u16(),
                message,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn reply_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_unreachable_helper_is_actionable() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TapClient::new(addr).create("vm1", 1).await.unwrap_err();
        assert!(matches!(err, CoreError::HelperUnavailable { .. }));
        assert!(err.to_string().contains("kestrel-tapd"));
    }

    #[tokio::test]
    async fn test_count_mismatch_rejected() {
        let addr = reply_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 22\r\nconnection: close\r\n\r\n{\"devices\":[\"vm1-0\"]}\n",
        )
        .await;
        let err = TapClient::new(addr).create("vm1", 2).await.unwrap_err();
        assert!(matches!(err, CoreError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_foreign_device_names_rejected() {
        let addr = reply_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 22\r\nconnection: close\r\n\r\n{\"devices\":[\"eth0-0\"]}\n",
        )
        .await;
        let err = TapClient::new(addr).create("vm1", 1).await.unwrap_err();
        assert!(matches!(err, CoreError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_expected_device_names_accepted() {
        let addr = reply_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 30\r\nconnection: close\r\n\r\n{\"devices\":[\"vm1-0\",\"vm1-1\"]}\n",
        )
        .await;
        let devices = TapClient::new(addr).create("vm1", 2).await.unwrap();
        assert_eq!(devices, ["vm1-0", "vm1-1"]);
    }

    #[tokio::test]
    async fn test_error_status_carries_message() {
        let addr = reply_once(
            "HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 30\r\nconnection: close\r\n\r\n{\"error\":\"bridge br0 missing\"}",
        )
        .await;
        let err = TapClient::new(addr).create("vm1", 1).await.unwrap_err();
        match err {
            CoreError::Helper { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bridge br0 missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_delete_skips_helper() {
        let client = TapClient::new("127.0.0.1:1".parse().unwrap());
        client.delete(&[]).await.unwrap();
    }
}
