//! Wire types for the tap helper protocol.
//!
//! | Method   | Body                      | Success                   |
//! |----------|---------------------------|---------------------------|
//! | `POST /` | [`CreateRequest`]         | 200 + [`CreateResponse`]  |
//! | `DELETE /` | [`DeleteRequest`]       | 200, idempotent           |
//!
//! Errors are returned as [`ErrorBody`] with a 4xx/5xx status.

use serde::{Deserialize, Serialize};

/// Loopback address the helper listens on by default.
pub const DEFAULT_HELPER_ADDR: &str = "127.0.0.1:7476";

/// Ask for `count` tap devices for VM `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// VM identifier; device names are derived from it.
    pub id: String,
    /// Number of interfaces.
    pub count: usize,
}

/// Devices created, in interface order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Device names, `<id>-0` through `<id>-<count-1>`.
    pub devices: Vec<String>,
}

/// Remove previously created devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Device names to remove; missing devices are ignored.
    pub devices: Vec<String>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error.
    pub error: String,
}

/// Device names for the interfaces of VM `id`.
pub fn device_names(id: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{id}-{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(device_names("vm1", 2), vec!["vm1-0", "vm1-1"]);
        assert!(device_names("vm1", 0).is_empty());
    }

    #[test]
    fn test_create_request_wire_format() {
        let json = serde_json::to_string(&CreateRequest {
            id: "vm1".into(),
            count: 2,
        })
        .unwrap();
        assert_eq!(json, r#"{"id":"vm1","count":2}"#);
    }
}
