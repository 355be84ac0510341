//! Error types for the DFU protocol engine.

use crate::opcode::ResultCode;

/// Errors raised while driving a DFU target.
#[derive(Debug, thiserror::Error)]
pub enum DfuError {
    #[error("failed to enable notifications: {0}")]
    NotificationStartError(String),

    #[error("failed to disable notifications: {0}")]
    NotificationStopError(String),

    #[error("timed out waiting for a control-point notification")]
    NotificationTimeout,

    #[error("offset mismatch: target reports {actual}, expected {expected}")]
    InvalidOffset { expected: u32, actual: u32 },

    #[error("crc mismatch: target reports {actual:#010x}, expected {expected:#010x}")]
    InvalidCrc { expected: u32, actual: u32 },

    #[error("init packet of {size} bytes exceeds target maximum of {max} bytes")]
    InitPacketTooLarge { size: u32, max: u32 },

    #[error("target: opcode not supported")]
    OpCodeNotSupported,

    #[error("target: invalid parameter")]
    InvalidParameter,

    #[error("target: insufficient resources")]
    InsufficientResources,

    #[error("target: invalid object")]
    InvalidObject,

    #[error("target: unsupported object type")]
    UnsupportedType,

    #[error("target: operation not permitted")]
    OperationNotPermitted,

    #[error("target: operation failed")]
    OperationFailed,

    #[error("target: invalid result code {0:#04x}")]
    InvalidResultCode(u8),

    #[error("malformed control-point response: {0}")]
    MalformedResponse(String),

    #[error("transfer aborted")]
    Aborted,

    #[error("invalid update package: {0}")]
    PackageInvalid(String),

    #[error(transparent)]
    Adapter(#[from] anyhow::Error),
}

impl From<ResultCode> for DfuError {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Success => {
                unreachable!("SUCCESS is not an error result code")
            }
            ResultCode::Invalid => DfuError::InvalidResultCode(0x00),
            ResultCode::OpCodeNotSupported => DfuError::OpCodeNotSupported,
            ResultCode::InvalidParameter => DfuError::InvalidParameter,
            ResultCode::InsufficientResources => DfuError::InsufficientResources,
            ResultCode::InvalidObject => DfuError::InvalidObject,
            ResultCode::UnsupportedType => DfuError::UnsupportedType,
            ResultCode::OperationNotPermitted => DfuError::OperationNotPermitted,
            ResultCode::OperationFailed => DfuError::OperationFailed,
        }
    }
}

impl DfuError {
    /// Whether `DfuTransport`'s per-object retry loop is allowed to retry after this error.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DfuError::Aborted | DfuError::NotificationTimeout)
    }
}
