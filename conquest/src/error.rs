use thiserror::Error;

use crate::services::DeviceId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConquestError {
    #[error("malformed report payload: {field} needs {needed} bytes, {remaining} remaining")]
    MalformedPayload {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("queue width must be between 1 and 8 bytes, got {0}")]
    InvalidQueueWidth(u8),

    #[error("failed to install rule on {device}: {reason}")]
    RuleInstallFailure { device: DeviceId, reason: String },

    #[error("failed to remove rule: {0}")]
    RuleRemovalFailure(String),

    #[error("group operation failed on {device}: {reason}")]
    GroupFailure { device: DeviceId, reason: String },

    #[error("policy service error: {0}")]
    PolicyFailure(String),

    #[error("device \"{0}\" is not found")]
    UnknownDevice(DeviceId),
}

pub type Result<T, E = ConquestError> = std::result::Result<T, E>;
