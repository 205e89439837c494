//! Model Layer Error Types

use errors::{ErrorCategory, HubErrorTrait};
use thiserror::Error;

/// Result type for device-model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model layer errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    // ======================================
    // Schema faults (load time)
    // ======================================
    /// Malformed or contradictory descriptor
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown parameter set type: {0}")]
    UnknownParameterSet(String),

    /// Partial byte placement declared wider than one byte
    #[error("Partial byte placement wider than one byte: {0}")]
    PartialByteTooWide(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("XML error in {file}: {error}")]
    Xml { file: String, error: String },

    // ======================================
    // Codec faults
    // ======================================
    #[error("Cannot decode {0}: buffer is empty")]
    EmptyBuffer(String),

    #[error("Size mismatch for {parameter}: {reason}")]
    SizeMismatch { parameter: String, reason: String },

    #[error("Type mismatch for {parameter}: expected {expected}, got {actual}")]
    TypeMismatch {
        parameter: String,
        expected: String,
        actual: String,
    },

    // ======================================
    // Lookup faults
    // ======================================
    #[error("Unknown channel: {0}")]
    UnknownChannel(u32),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    // ======================================
    // Registry faults
    // ======================================
    #[error("No device descriptions could be loaded from {0}")]
    NoDescriptions(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io(err.to_string())
    }
}

// Helper methods
impl ModelError {
    pub fn schema(msg: impl Into<String>) -> Self {
        ModelError::Schema(msg.into())
    }

    pub fn type_mismatch(
        parameter: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        ModelError::TypeMismatch {
            parameter: parameter.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl HubErrorTrait for ModelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "SCHEMA_ERROR",
            Self::UnknownParameterSet(_) => "UNKNOWN_PARAMETER_SET",
            Self::PartialByteTooWide(_) => "PARTIAL_BYTE_TOO_WIDE",
            Self::InvalidNumber(_) => "INVALID_NUMBER",
            Self::Xml { .. } => "XML_ERROR",
            Self::EmptyBuffer(_) => "EMPTY_BUFFER",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            Self::UnknownParameter(_) => "UNKNOWN_PARAMETER",
            Self::NoDescriptions(_) => "NO_DESCRIPTIONS",
            Self::Io(_) => "IO_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Schema(_)
            | Self::UnknownParameterSet(_)
            | Self::PartialByteTooWide(_)
            | Self::InvalidNumber(_)
            | Self::Xml { .. }
            | Self::NoDescriptions(_) => ErrorCategory::Description,
            Self::EmptyBuffer(_) | Self::SizeMismatch { .. } => ErrorCategory::DataCorruption,
            Self::TypeMismatch { .. } => ErrorCategory::Validation,
            Self::UnknownChannel(_) | Self::UnknownParameter(_) => ErrorCategory::NotFound,
            Self::Io(_) => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_codec_faults_are_not_retryable() {
        let err = ModelError::EmptyBuffer("LEVEL".into());
        assert!(!err.is_retryable());
        assert!(err.should_alert());
        assert_eq!(err.error_code(), "EMPTY_BUFFER");
    }
}
