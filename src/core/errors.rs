//! KD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, KeydeckError>;

/// Top-level error type for keydeckd.
#[derive(Debug, Error)]
pub enum KeydeckError {
    #[error("[KD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[KD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[KD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[KD-1004] page `{page}` referenced by `{from}` does not exist")]
    UnknownPage { page: String, from: String },

    #[error("[KD-2001] cache root unavailable: {path}: {details}")]
    CacheUnavailable { path: PathBuf, details: String },

    #[error("[KD-2002] external icon rejected for `{spec}`: {reason}")]
    ExternalIconRejected { spec: String, reason: String },

    #[error("[KD-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[KD-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[KD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[KD-3900] runtime failure: {details}")]
    Runtime { details: String },

    #[error("[KD-4001] device protocol error: {details}")]
    DeviceProtocol { details: String },

    #[error("[KD-4002] device not ready")]
    DeviceNotReady,

    #[error("[KD-4101] home-automation protocol error: {details}")]
    HaProtocol { details: String },

    #[error("[KD-5001] command `{cmd}` timed out after {timeout_ms}ms")]
    CommandTimeout { cmd: String, timeout_ms: u64 },

    #[error("[KD-5002] command `{cmd}` exited with status {status}")]
    CommandFailed { cmd: String, status: i32 },
}

impl KeydeckError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "KD-1001",
            Self::MissingConfig { .. } => "KD-1002",
            Self::ConfigParse { .. } => "KD-1003",
            Self::UnknownPage { .. } => "KD-1004",
            Self::CacheUnavailable { .. } => "KD-2001",
            Self::ExternalIconRejected { .. } => "KD-2002",
            Self::Serialization { .. } => "KD-2101",
            Self::PermissionDenied { .. } => "KD-3001",
            Self::Io { .. } => "KD-3002",
            Self::Runtime { .. } => "KD-3900",
            Self::DeviceProtocol { .. } => "KD-4001",
            Self::DeviceNotReady => "KD-4002",
            Self::HaProtocol { .. } => "KD-4101",
            Self::CommandTimeout { .. } => "KD-5001",
            Self::CommandFailed { .. } => "KD-5002",
        }
    }

    /// Whether retrying might resolve the failure (used by the event loop's
    /// reconnect/retry policies rather than propagating to process exit).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Runtime { .. }
                | Self::DeviceProtocol { .. }
                | Self::DeviceNotReady
                | Self::HaProtocol { .. }
                | Self::CommandTimeout { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for KeydeckError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for KeydeckError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::ConfigParse {
            context: "serde_yaml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KeydeckError;

    #[test]
    fn codes_are_stable() {
        let err = KeydeckError::MissingConfig {
            path: "/etc/keydeckd/config.yaml".into(),
        };
        assert_eq!(err.code(), "KD-1002");
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_errors_are_retryable() {
        let err = KeydeckError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "nope"),
        );
        assert!(err.is_retryable());
    }
}
