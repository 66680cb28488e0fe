//! Helper error taxonomy
//!
//! A closed set of failure kinds. The helper only ever replies with
//! structured data from this set; presenting it to the user is the app's job.

use crate::ERROR_DOMAIN;
use serde::{Deserialize, Serialize};

/// Integer code of each error kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ErrorCode {
    Unknown = 0,
    UnreadableConfigurationFile = 1,
    UnexpectedEncodingConfigurationFile = 2,
    DangerousCommandsInConfigurationFile = 3,
    BinarySignatureNotSignedByUs = 4,
    UpScriptSignatureNotSignedByUs = 5,
    DownScriptSignatureNotSignedByUs = 6,
    LeasewatchScriptSignatureNotSignedByUs = 7,
    NotRunning = 8,
}

impl ErrorCode {
    /// Raw integer value
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for ErrorCode {
    type Error = WireErrorDecode;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Unknown),
            1 => Ok(ErrorCode::UnreadableConfigurationFile),
            2 => Ok(ErrorCode::UnexpectedEncodingConfigurationFile),
            3 => Ok(ErrorCode::DangerousCommandsInConfigurationFile),
            4 => Ok(ErrorCode::BinarySignatureNotSignedByUs),
            5 => Ok(ErrorCode::UpScriptSignatureNotSignedByUs),
            6 => Ok(ErrorCode::DownScriptSignatureNotSignedByUs),
            7 => Ok(ErrorCode::LeasewatchScriptSignatureNotSignedByUs),
            8 => Ok(ErrorCode::NotRunning),
            other => Err(WireErrorDecode::UnknownCode(other)),
        }
    }
}

/// Helper errors
///
/// Serialized as a [`WireError`] so the app sees the `domain`/`code` pair
/// plus the offending commands where relevant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(into = "WireError", try_from = "WireError")]
pub enum HelperError {
    #[error("Unknown helper failure")]
    Unknown,

    #[error("Configuration file could not be read")]
    UnreadableConfigurationFile,

    #[error("Configuration file is not valid UTF-8")]
    UnexpectedEncodingConfigurationFile,

    #[error("Configuration file contains dangerous commands: {}", .0.join(", "))]
    DangerousCommandsInConfigurationFile(Vec<String>),

    #[error("OpenVPN binary is not signed by us")]
    BinarySignatureNotSignedByUs,

    #[error("Up script is not signed by us")]
    UpScriptSignatureNotSignedByUs,

    #[error("Down script is not signed by us")]
    DownScriptSignatureNotSignedByUs,

    #[error("Leasewatch script is not signed by us")]
    LeasewatchScriptSignatureNotSignedByUs,

    #[error("No OpenVPN session is running")]
    NotRunning,
}

impl HelperError {
    /// Wire code of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            HelperError::Unknown => ErrorCode::Unknown,
            HelperError::UnreadableConfigurationFile => ErrorCode::UnreadableConfigurationFile,
            HelperError::UnexpectedEncodingConfigurationFile => {
                ErrorCode::UnexpectedEncodingConfigurationFile
            }
            HelperError::DangerousCommandsInConfigurationFile(_) => {
                ErrorCode::DangerousCommandsInConfigurationFile
            }
            HelperError::BinarySignatureNotSignedByUs => ErrorCode::BinarySignatureNotSignedByUs,
            HelperError::UpScriptSignatureNotSignedByUs => {
                ErrorCode::UpScriptSignatureNotSignedByUs
            }
            HelperError::DownScriptSignatureNotSignedByUs => {
                ErrorCode::DownScriptSignatureNotSignedByUs
            }
            HelperError::LeasewatchScriptSignatureNotSignedByUs => {
                ErrorCode::LeasewatchScriptSignatureNotSignedByUs
            }
            HelperError::NotRunning => ErrorCode::NotRunning,
        }
    }

    /// Offending commands, empty unless this is the dangerous-commands kind
    pub fn dangerous_commands(&self) -> &[String] {
        match self {
            HelperError::DangerousCommandsInConfigurationFile(commands) => commands,
            _ => &[],
        }
    }

    /// Is this one of the signature failures?
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::BinarySignatureNotSignedByUs
                | ErrorCode::UpScriptSignatureNotSignedByUs
                | ErrorCode::DownScriptSignatureNotSignedByUs
                | ErrorCode::LeasewatchScriptSignatureNotSignedByUs
        )
    }
}

/// Error as it travels over the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Always [`ERROR_DOMAIN`]
    pub domain: String,
    /// One of [`ErrorCode`]
    pub code: i64,
    /// Offending directives (code 3 only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dangerous_commands: Vec<String>,
}

impl From<HelperError> for WireError {
    fn from(error: HelperError) -> Self {
        let code = error.code().as_i64();
        let dangerous_commands = match error {
            HelperError::DangerousCommandsInConfigurationFile(commands) => commands,
            _ => Vec::new(),
        };

        Self {
            domain: ERROR_DOMAIN.to_string(),
            code,
            dangerous_commands,
        }
    }
}

impl TryFrom<WireError> for HelperError {
    type Error = WireErrorDecode;

    fn try_from(wire: WireError) -> Result<Self, Self::Error> {
        if wire.domain != ERROR_DOMAIN {
            return Err(WireErrorDecode::ForeignDomain(wire.domain));
        }

        Ok(match ErrorCode::try_from(wire.code)? {
            ErrorCode::Unknown => HelperError::Unknown,
            ErrorCode::UnreadableConfigurationFile => HelperError::UnreadableConfigurationFile,
            ErrorCode::UnexpectedEncodingConfigurationFile => {
                HelperError::UnexpectedEncodingConfigurationFile
            }
            ErrorCode::DangerousCommandsInConfigurationFile => {
                HelperError::DangerousCommandsInConfigurationFile(wire.dangerous_commands)
            }
            ErrorCode::BinarySignatureNotSignedByUs => HelperError::BinarySignatureNotSignedByUs,
            ErrorCode::UpScriptSignatureNotSignedByUs => {
                HelperError::UpScriptSignatureNotSignedByUs
            }
            ErrorCode::DownScriptSignatureNotSignedByUs => {
                HelperError::DownScriptSignatureNotSignedByUs
            }
            ErrorCode::LeasewatchScriptSignatureNotSignedByUs => {
                HelperError::LeasewatchScriptSignatureNotSignedByUs
            }
            ErrorCode::NotRunning => HelperError::NotRunning,
        })
    }
}

/// Failure to interpret a [`WireError`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireErrorDecode {
    #[error("Unknown error code: {0}")]
    UnknownCode(i64),

    #[error("Error from foreign domain: {0}")]
    ForeignDomain(String),
}
