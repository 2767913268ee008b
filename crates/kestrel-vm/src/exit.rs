//! Machine exit reporting shared by every hypervisor driver.

use std::fmt;

/// How a machine's process (or hypervisor session) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineExit {
    /// Exit code, if the hypervisor reported one.
    pub code: Option<i32>,
}

impl MachineExit {
    /// Exit with a known code.
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Exit whose status could not be determined (signal, lost process).
    pub fn unknown() -> Self {
        Self { code: None }
    }

    /// True for a clean zero exit.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for MachineExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for MachineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated"),
        }
    }
}
