//! Error types for the storage dock
//!
//! Every failure a driver or the dispatch layer can produce is one variant of
//! [`Error`]. Each variant maps onto exactly one [`ErrorKind`], and the kind
//! decides the code carried by the reply envelope.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the dock and its drivers
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unreachable: {backend}: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    #[error("Backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected {operation} on {backend}: {reason}")]
    BackendRejected {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Resource State Errors
    // =========================================================================
    #[error("{kind}[{name}] not found")]
    NotFound { kind: String, name: String },

    #[error("{kind}[{name}] already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no action: {0}")]
    UnknownOperation(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    #[error("Timed out after {elapsed:?}: {operation}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Method {operation} has not been implemented yet")]
    NotImplemented { operation: String },

    #[error("Command {command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy shared by every driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigError,
    BackendUnreachable,
    BackendRejected,
    NotFound,
    AlreadyExists,
    Conflict,
    InvalidArgument,
    Timeout,
    NotImplemented,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::BackendUnreachable => "BackendUnreachable",
            ErrorKind::BackendRejected => "BackendRejected",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for an `AlreadyExists` error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a `NotImplemented` error
    pub fn not_implemented(operation: impl Into<String>) -> Self {
        Error::NotImplemented {
            operation: operation.into(),
        }
    }

    /// Shorthand for a `BackendRejected` error
    pub fn rejected(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::BackendRejected {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error into the shared taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::YamlParse(_) => ErrorKind::ConfigError,
            Error::BackendUnreachable { .. } | Error::Http(_) => ErrorKind::BackendUnreachable,
            Error::BackendRejected { .. } => ErrorKind::BackendRejected,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidArgument(_) | Error::UnknownOperation(_) => ErrorKind::InvalidArgument,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::NotImplemented { .. } => ErrorKind::NotImplemented,
            Error::CommandFailed { .. }
            | Error::Internal(_)
            | Error::JsonParse(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Reply code carried by the dispatch envelope
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidArgument
            | ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::Conflict => "400",
            ErrorKind::NotImplemented => "501",
            _ => "500",
        }
    }

    /// Check if the failure may clear up on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnreachable | ErrorKind::Timeout
        )
    }

    /// Check if this error means the target is already gone
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type alias for the dock
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidArgument("bad".into()).code(), "400");
        assert_eq!(Error::not_found("volume", "v1").code(), "400");
        assert_eq!(Error::Conflict("shrink".into()).code(), "400");
        assert_eq!(Error::not_implemented("pull_volume").code(), "501");
        assert_eq!(Error::Internal("boom".into()).code(), "500");
        assert_eq!(
            Error::rejected("ontap", "create_volume", "quota").code(),
            "500"
        );
    }

    #[test]
    fn test_error_transient() {
        let unreachable = Error::BackendUnreachable {
            backend: "ontap".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_transient());

        let timeout = Error::Timeout {
            operation: "job 42".into(),
            elapsed: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());

        let config_err = Error::Configuration("missing svm".into());
        assert!(!config_err.is_transient());
        assert_eq!(config_err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn test_already_exists_message() {
        let err = Error::already_exists("source volume", "A");
        assert_eq!(err.to_string(), "source volume[A] already exists");
    }

    #[test]
    fn test_unknown_operation() {
        let err = Error::UnknownOperation("resize_pool".into());
        assert_eq!(err.code(), "400");
        assert_eq!(err.to_string(), "no action: resize_pool");
    }

    #[test]
    fn test_command_failure_is_internal() {
        let err = Error::CommandFailed {
            command: "mount".into(),
            output: "permission denied".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("mount"));
    }
}
