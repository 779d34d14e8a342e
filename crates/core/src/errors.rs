//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, sandbox runtime, filesystem snapshots) that are then wrapped
//! in the main [`StudyError`] enum. State-machine and lifecycle failures that
//! callers branch on (`InvalidState`, `NotFound`, `ProvisioningFailure`,
//! `UnrecognizedTaskType`) are top-level variants.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Sandbox runtime (docker/podman CLI) errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or not accessible
    #[error("Container runtime is not installed or not accessible")]
    NotInstalled,

    /// Runtime CLI command error
    #[error("Runtime CLI error: {0}")]
    CliError(String),

    /// Container not found
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// Command execution failed
    #[error("Command execution failed with exit code {code}")]
    ExecFailed { code: i32 },
}

/// Filesystem snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// I/O failure while walking or writing a tree
    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Tree (de)serialization failure
    #[error("Invalid filesystem tree JSON")]
    Json(#[from] serde_json::Error),

    /// Entry type the codec cannot represent (sockets, devices, fifos)
    #[error("Unsupported filesystem entry: {path}")]
    Unsupported { path: String },
}

impl SnapshotError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum StudyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sandbox runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Filesystem snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A state-machine operation was attempted from an incompatible status
    #[error("Invalid state: cannot {operation} {entity} in status '{status}'")]
    InvalidState {
        entity: String,
        status: String,
        operation: String,
    },

    /// Referenced entity is absent from the repository
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Sandbox did not become ready, or port discovery failed
    #[error("Failed to provision sandbox '{name}': {reason}")]
    ProvisioningFailure { name: String, reason: String },

    /// Task type label outside the known set
    #[error("Unrecognized task type '{label}': must be one of stdout, file_search, filesystem_change")]
    UnrecognizedTaskType { label: String },

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StudyError {
    pub(crate) fn invalid_state(
        entity: impl Into<String>,
        status: impl std::fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            status: status.to_string(),
            operation: operation.into(),
        }
    }

    pub(crate) fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

/// Convenience type alias for Results with StudyError
pub type Result<T> = std::result::Result<T, StudyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Parsing {
            message: "Invalid JSON".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Failed to parse configuration file: Invalid JSON"
        );

        let error = ConfigError::NotFound {
            path: "/path/to/study.json5".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration file not found: /path/to/study.json5"
        );
    }

    #[test]
    fn test_taxonomy_display() {
        let error = StudyError::invalid_state("study session", "finished", "generate a task session id for");
        assert_eq!(
            error.to_string(),
            "Invalid state: cannot generate a task session id for study session in status 'finished'"
        );

        let error = StudyError::not_found("TaskSession", "alice-study_session-1-task-3");
        assert_eq!(
            error.to_string(),
            "TaskSession not found: alice-study_session-1-task-3"
        );

        let error = StudyError::UnrecognizedTaskType {
            label: "permissions".to_string(),
        };
        assert!(error.to_string().contains("'permissions'"));
    }

    #[test]
    fn test_from_domain_errors() {
        let err: StudyError = RuntimeError::NotInstalled.into();
        assert!(matches!(err, StudyError::Runtime(_)));

        let err: StudyError = ConfigError::Validation {
            message: "x".to_string(),
        }
        .into();
        assert!(matches!(err, StudyError::Config(_)));
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err = StudyError::Snapshot(SnapshotError::io(std::path::Path::new("/tmp/x"), io_error));

        assert!(err.source().is_some());
        if let Some(source) = err.source() {
            assert!(source.source().is_some());
        }
    }

    #[test]
    fn test_anyhow_conversion() {
        let err = StudyError::ProvisioningFailure {
            name: "s-1".to_string(),
            reason: "not ready".to_string(),
        };
        let anyhow_error = anyhow::Error::from(err);
        assert!(anyhow_error.to_string().contains("Failed to provision sandbox"));
    }
}
