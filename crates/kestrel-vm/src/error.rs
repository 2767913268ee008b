//! Error types for kestrel-vm.

use thiserror::Error;

/// Result type alias for kestrel-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while driving a hypervisor.
#[derive(Debug, Error)]
pub enum VmError {
    /// Failed to launch the hypervisor process or register the machine
    #[error("failed to create VM: {0}")]
    Create(String),

    /// Failed to boot the guest
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Failed to stop the guest
    #[error("failed to stop VM: {0}")]
    Stop(String),

    /// Machine is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Firecracker API socket returned an error or could not be reached
    #[error("firecracker API error: {0}")]
    Api(String),

    /// External management command exited unsuccessfully
    #[error("{program} {args} failed ({code:?}): {stderr}")]
    Command {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
