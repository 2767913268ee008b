//! Helper error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use kestrel_core::tapnet::protocol::ErrorBody;
use thiserror::Error;

/// Result type for helper operations.
pub type Result<T> = std::result::Result<T, TapdError>;

/// Errors the helper reports to its clients.
#[derive(Debug, Error)]
pub enum TapdError {
    /// The request body could not be decoded or is invalid.
    #[error("{0}")]
    BadRequest(String),

    /// The bridge devices are attached to is missing or unusable.
    #[error("bridge {bridge}: {message}")]
    Bridge { bridge: String, message: String },

    /// A device operation failed.
    #[error("device {device}: {message}")]
    Device { device: String, message: String },

    /// The DHCP responder could not be run.
    #[error("dhcp: {0}")]
    Dhcp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TapdError {
    /// HTTP status reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Bridge { .. } => StatusCode::BAD_REQUEST,
            Self::Device { .. } | Self::Dhcp(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TapdError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TapdError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TapdError::Bridge {
                bridge: "kestrel0".into(),
                message: "Device \"kestrel0\" does not exist.".into(),
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TapdError::Device {
                device: "vm1-0".into(),
                message: "busy".into(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_bridge_message_keeps_system_text() {
        let err = TapdError::Bridge {
            bridge: "kestrel0".into(),
            message: "Device \"kestrel0\" does not exist.".into(),
        };
        assert_eq!(
            err.to_string(),
            "bridge kestrel0: Device \"kestrel0\" does not exist."
        );
    }
}
