//! Unified error handling for the wired hub services
//!
//! Each crate keeps its own domain error type (`ModelError`, `WiredError`) and
//! gains a common outward-facing interface by implementing [`HubErrorTrait`].
//! Failures are reported with [`log_error!`], which picks the level from
//! the error's category.

use tracing::Level;

#[doc(hidden)]
pub use tracing;

// ============================================================================
// Hub Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Database,
    Network,
    Timeout,

    // Business logic layer
    Validation,
    NotFound,

    // Bus layer
    Protocol,
    Connection,

    // Device description layer
    Description,

    // System level
    Internal,
    ResourceBusy,
    DataCorruption,

    Unknown,
}

/// Hub error capability trait
///
/// Service error types keep their domain-specific variants and present a
/// common interface through this trait. Defaults are category-based so most
/// implementors only provide `error_code` and `category`.
pub trait HubErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and monitoring)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::ResourceBusy
        )
    }

    /// Get log level
    fn log_level(&self) -> Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database | ErrorCategory::DataCorruption => {
                Level::ERROR
            },
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::Description => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Whether an alert should be triggered
    fn should_alert(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Internal | ErrorCategory::Database | ErrorCategory::DataCorruption
        )
    }
}

/// Log a [`HubErrorTrait`] error at its category's level, tagged with the
/// error code. The message reads `<formatted context>: <error>`.
#[macro_export]
macro_rules! log_error {
    ($err:expr, $($arg:tt)+) => {{
        let err = &$err;
        let code = $crate::HubErrorTrait::error_code(err);
        let retryable = $crate::HubErrorTrait::is_retryable(err);
        let alert = $crate::HubErrorTrait::should_alert(err);
        let level = $crate::HubErrorTrait::log_level(err);
        if level == $crate::tracing::Level::ERROR {
            $crate::tracing::error!(code, retryable, alert, "{}: {}", format_args!($($arg)+), err);
        } else if level == $crate::tracing::Level::WARN {
            $crate::tracing::warn!(code, retryable, alert, "{}: {}", format_args!($($arg)+), err);
        } else if level == $crate::tracing::Level::INFO {
            $crate::tracing::info!(code, retryable, alert, "{}: {}", format_args!($($arg)+), err);
        } else {
            $crate::tracing::debug!(code, retryable, alert, "{}: {}", format_args!($($arg)+), err);
        }
    }};
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use thiserror::Error;
    use tracing_test::traced_test;

    #[derive(Debug, Error)]
    enum SampleError {
        #[error("no answer from {0}")]
        Silent(String),
        #[error("table locked")]
        Locked,
        #[error("no such channel {0}")]
        Missing(u32),
    }

    impl HubErrorTrait for SampleError {
        fn error_code(&self) -> &'static str {
            match self {
                Self::Silent(_) => "SILENT",
                Self::Locked => "LOCKED",
                Self::Missing(_) => "MISSING",
            }
        }

        fn category(&self) -> ErrorCategory {
            match self {
                Self::Silent(_) => ErrorCategory::Connection,
                Self::Locked => ErrorCategory::Database,
                Self::Missing(_) => ErrorCategory::NotFound,
            }
        }
    }

    #[test]
    fn test_trait_defaults_follow_category() {
        let err = SampleError::Silent("0x00000042".into());
        assert!(err.is_retryable());
        assert!(!err.should_alert());
        assert_eq!(err.log_level(), Level::WARN);

        let err = SampleError::Locked;
        assert!(!err.is_retryable());
        assert!(err.should_alert());
        assert_eq!(err.log_level(), Level::ERROR);

        assert_eq!(SampleError::Missing(9).log_level(), Level::INFO);
    }

    #[test]
    #[traced_test]
    fn test_log_uses_category_level() {
        log_error!(SampleError::Locked, "Peer {}: save failed", 7);
        log_error!(SampleError::Missing(9), "Peer 7: lookup");

        assert!(logs_contain("ERROR"));
        assert!(logs_contain("Peer 7: save failed: table locked"));
        assert!(logs_contain("LOCKED"));
        assert!(logs_contain("alert=true"));
        assert!(logs_contain("Peer 7: lookup: no such channel 9"));
    }
}
