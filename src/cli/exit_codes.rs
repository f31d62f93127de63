//! CLI Exit Codes
//!
//! Stable exit codes for scripting around `harpcom`.

use crate::core::error::HarpError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// No reply in time
    pub const TIMEOUT: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error (corrupt stream, unexpected payload)
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Device answered with an error reply
    pub const DEVICE_ERROR: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device busy or port in use
    pub const DEVICE_BUSY: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Request rejected by the register catalog
    pub const ACCESS_VIOLATION: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Error with explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::PortInUse(_) => ExitCodes::DEVICE_BUSY,
        TransportError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

impl From<&HarpError> for CliResult {
    fn from(err: &HarpError) -> Self {
        let code = match err {
            HarpError::Transport { source, .. } => transport_code(source),
            HarpError::Timeout { .. } => ExitCodes::TIMEOUT,
            HarpError::Corrupted { .. } | HarpError::UnexpectedPayload { .. } => ExitCodes::PROTOCOL_ERROR,
            HarpError::Device { .. } => ExitCodes::DEVICE_ERROR,
            HarpError::AccessViolation { .. } => ExitCodes::ACCESS_VIOLATION,
            HarpError::Encode { .. } | HarpError::InvalidRequest { .. } => ExitCodes::INVALID_ARGS,
            HarpError::SessionClosed { .. } => ExitCodes::CONNECTION_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<HarpError> for CliResult {
    fn from(err: HarpError) -> Self {
        Self::from(&err)
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "No reply from device",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        10 => "Device error reply",
        11 => "Operation cancelled",
        13 => "Device busy",
        14 => "Port not found",
        17 => "Access violation",
        127 => "Internal error",
        _ => "Unknown error",
    }
}
