//! Error types for kestrel-core.

use crate::state::VmState;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for kestrel-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while managing virtual machines.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A VM with this name is already active
    #[error("VM {0} already exists")]
    DuplicateVm(String),

    /// A virtualizer with this name is already in the catalog
    #[error("virtualizer {0} already exists")]
    DuplicateVirtualizer(String),

    /// No catalog entry with this name
    #[error("virtualizer not found: {0}")]
    VirtualizerNotFound(String),

    /// No active VM with this name
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// No backend registered under this identity
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Backend is registered but cannot run on this host
    #[error("backend {0} is not available on this host")]
    BackendUnavailable(String),

    /// Backend rejected the virtualizer configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stop requested on a VM that is not running
    #[error("VM {0} is already stopped")]
    AlreadyStopped(String),

    /// VM is not in a state that allows the operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// State(s) the operation requires
        expected: String,
        /// State the VM was in
        actual: VmState,
    },

    /// VM did not reach the requested state within its retry budget
    #[error("VM {0} is broken: {1}")]
    Broken(String, String),

    /// The privileged network helper could not be reached
    #[error("network helper unreachable at {addr}: {reason} (is kestrel-tapd running? start it as root with `sudo kestrel-tapd`)")]
    HelperUnavailable {
        /// Address the client dialed
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },

    /// The network helper answered with an error status
    #[error("network helper returned {status}: {message}")]
    Helper {
        /// HTTP status code
        status: u16,
        /// Error message from the helper
        message: String,
    },

    /// Resources for the VM could not be provisioned
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Disk image download failed
    #[error("download failed: {0}")]
    Download(String),

    /// Timed out waiting for an external party
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Error from kestrel-vm
    #[error("VM error: {0}")]
    Vm(#[from] kestrel_vm::VmError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn invalid_state(expected: impl Into<String>, actual: VmState) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual,
        }
    }
}
