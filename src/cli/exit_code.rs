//! Exit code definitions for ssh-audit-proxy
//!
//! Provides standardized exit codes for different error conditions.

use crate::error::Error;

/// Exit codes for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Configuration error (invalid config, unreadable host key)
    ConfigError = 2,
    /// Listen error (cannot bind the SSH listener)
    ListenError = 3,
    /// Control plane error (cannot reach the IPC socket)
    ControlPlaneError = 4,
}

impl ExitCode {
    /// Classify an error chain by its first crate error
    pub fn from_error(error: &anyhow::Error) -> Self {
        let Some(error) = error.chain().find_map(|e| e.downcast_ref::<Error>()) else {
            return ExitCode::GeneralError;
        };
        match error {
            Error::Config(_) | Error::TomlParse(_) | Error::Key(_) => ExitCode::ConfigError,
            Error::Listen(_) => ExitCode::ListenError,
            Error::ControlPlane(_) => ExitCode::ControlPlaneError,
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
