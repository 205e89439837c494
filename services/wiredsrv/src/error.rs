//! Error handling for the wired bus service
//!
//! Transport faults mark a destination unreachable and surface as
//! communication failures; addressing faults come back from the block store
//! and parameter lookups; codec and schema faults pass through from
//! `device-model` unchanged.

use device_model::ModelError;
use errors::{ErrorCategory, HubErrorTrait};
use thiserror::Error;

use crate::core::transport::TransportError;

#[derive(Error, Debug, Clone)]
pub enum WiredError {
    // ======================================
    // Transport
    // ======================================
    #[error("Device 0x{address:08X} unreachable")]
    Unreachable { address: u32 },

    #[error("Malformed response from 0x{address:08X}: {reason}")]
    MalformedResponse { address: u32, reason: String },

    #[error("Request too large: {len} bytes (max {max})")]
    RequestTooLarge { len: usize, max: usize },

    #[error("Device is being disposed")]
    Disposing,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ======================================
    // Addressing
    // ======================================
    #[error("Address {address} size {size} is outside the configuration memory")]
    AddressOutOfRange { address: String, size: String },

    #[error("Unknown channel: {0}")]
    UnknownChannel(u32),

    #[error("Channel {channel} has no {kind} parameter set")]
    UnknownParameterSet { channel: u32, kind: String },

    #[error("No link on channel {channel} to peer {remote_id} channel {remote_channel}")]
    NotPaired {
        channel: u32,
        remote_id: u64,
        remote_channel: u32,
    },

    #[error("Cannot address parameter {0}")]
    AddressingUnsupported(String),

    #[error("Parameter {0} is not writable")]
    ReadOnly(String),

    // ======================================
    // Storage & configuration
    // ======================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, WiredError>;

impl WiredError {
    pub fn storage(msg: impl Into<String>) -> Self {
        WiredError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        WiredError::Config(msg.into())
    }

    /// A fault on the bus rather than in the request itself
    pub fn is_communication_failure(&self) -> bool {
        matches!(
            self,
            WiredError::Unreachable { .. }
                | WiredError::MalformedResponse { .. }
                | WiredError::Transport(_)
        )
    }
}

impl From<sqlx::Error> for WiredError {
    fn from(err: sqlx::Error) -> Self {
        WiredError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for WiredError {
    fn from(err: anyhow::Error) -> Self {
        WiredError::Storage(err.to_string())
    }
}

impl From<common::Error> for WiredError {
    fn from(err: common::Error) -> Self {
        WiredError::Config(err.to_string())
    }
}

// ============================================================================
// WiredError implements HubErrorTrait
// ============================================================================

impl HubErrorTrait for WiredError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "WIRED_UNREACHABLE",
            Self::MalformedResponse { .. } => "WIRED_MALFORMED_RESPONSE",
            Self::RequestTooLarge { .. } => "WIRED_REQUEST_TOO_LARGE",
            Self::Disposing => "WIRED_DISPOSING",
            Self::Transport(_) => "WIRED_TRANSPORT_ERROR",
            Self::AddressOutOfRange { .. } => "WIRED_ADDRESS_OUT_OF_RANGE",
            Self::UnknownChannel(_) => "WIRED_UNKNOWN_CHANNEL",
            Self::UnknownParameterSet { .. } => "WIRED_UNKNOWN_PARAMSET",
            Self::NotPaired { .. } => "WIRED_NOT_PAIRED",
            Self::AddressingUnsupported(_) => "WIRED_ADDRESSING_UNSUPPORTED",
            Self::ReadOnly(_) => "WIRED_READ_ONLY",
            Self::Storage(_) => "WIRED_STORAGE_ERROR",
            Self::Config(_) => "WIRED_CONFIG_ERROR",
            Self::Model(e) => e.error_code(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Unreachable { .. } => ErrorCategory::Connection,
            Self::MalformedResponse { .. } => ErrorCategory::Protocol,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Disposing => ErrorCategory::ResourceBusy,
            Self::RequestTooLarge { .. } | Self::ReadOnly(_) => ErrorCategory::Validation,
            Self::AddressOutOfRange { .. } | Self::AddressingUnsupported(_) => {
                ErrorCategory::Validation
            },
            Self::UnknownChannel(_) | Self::UnknownParameterSet { .. } | Self::NotPaired { .. } => {
                ErrorCategory::NotFound
            },
            Self::Storage(_) => ErrorCategory::Database,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Model(e) => e.category(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_is_retryable_connection_fault() {
        let err = WiredError::Unreachable { address: 0x42 };
        assert_eq!(err.to_string(), "Device 0x00000042 unreachable");
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.is_communication_failure());
        assert!(err.is_retryable());
        assert_eq!(err.log_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_model_errors_keep_their_classification() {
        let err: WiredError = ModelError::EmptyBuffer("STATE".into()).into();
        assert!(!err.is_communication_failure());
        let model = ModelError::EmptyBuffer("STATE".into());
        assert_eq!(err.error_code(), model.error_code());
        assert_eq!(err.category(), model.category());
    }
}
