//! Error types for the storage control plane
//!
//! Provides structured error types for configuration, privileged request
//! forwarding, storage providers, engine runners and the instance harness.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a forwarded request never produced a helper response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingCause {
    /// Helper could not be located or spawned
    Launch,
    /// Reading from or writing to the helper channel failed
    Channel,
    /// Helper exited before answering
    Exited,
    /// Helper did not answer within the configured timeout
    Timeout,
}

impl std::fmt::Display for ForwardingCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardingCause::Launch => write!(f, "launch"),
            ForwardingCause::Channel => write!(f, "channel"),
            ForwardingCause::Exited => write!(f, "exited"),
            ForwardingCause::Timeout => write!(f, "timeout"),
        }
    }
}

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Privileged Forwarding Errors
    // =========================================================================
    #[error("Forwarding to {helper} failed ({cause}): {reason}")]
    Forwarding {
        helper: String,
        cause: ForwardingCause,
        reason: String,
    },

    #[error("Privileged helper protocol error: {0}")]
    Protocol(String),

    #[error("Insufficient privilege for {operation}")]
    Privilege { operation: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("Provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    // =========================================================================
    // Harness / Runner Errors
    // =========================================================================
    #[error("Harness state error: {0}")]
    HarnessState(String),

    #[error("Runner error for instance {instance}: {reason}")]
    Runner { instance: u32, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Prevents startup or the current operation from ever succeeding
    Fatal,
    /// May succeed if the caller tries again later
    Recoverable,
    /// Programming-level misuse of an API
    Misuse,
}

impl Error {
    /// Classify this error
    pub fn severity(&self) -> Severity {
        match self {
            Error::Forwarding { .. }
            | Error::Protocol(_)
            | Error::Provider { .. }
            | Error::Runner { .. }
            | Error::Io(_) => Severity::Recoverable,

            Error::HarnessState(_) => Severity::Misuse,

            Error::Configuration(_)
            | Error::Privilege { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => Severity::Fatal,
        }
    }

    /// Check if a caller-owned retry policy may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self.severity(), Severity::Recoverable)
    }

    /// Check if this error was caused by a forwarding timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Forwarding {
                cause: ForwardingCause::Timeout,
                ..
            }
        )
    }

    pub(crate) fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn privilege(operation: impl Into<String>) -> Self {
        Error::Privilege {
            operation: operation.into(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = Error::Configuration("bad device list".into());
        assert_eq!(err.severity(), Severity::Fatal);

        let err = Error::HarnessState("already started".into());
        assert_eq!(err.severity(), Severity::Misuse);

        let err = Error::provider("bdev-nvme", "format failed");
        assert_eq!(err.severity(), Severity::Recoverable);
    }

    #[test]
    fn test_error_retryable() {
        let timeout = Error::Forwarding {
            helper: "storage_admin".into(),
            cause: ForwardingCause::Timeout,
            reason: "no response after 30s".into(),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let denied = Error::privilege("scm format");
        assert!(!denied.is_retryable());
        assert!(!denied.is_timeout());
    }
}
