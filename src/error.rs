//! Error types for pve-cri

use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendKind;

/// Errors raised by a backend driver.
///
/// Drivers never leak tool-specific error shapes: every failed process
/// invocation or HTTP round-trip is classified into one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("runtime error{}: {message}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    RuntimeError {
        message: String,
        exit_code: Option<i32>,
    },
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl BackendError {
    pub fn runtime(message: impl Into<String>) -> Self {
        BackendError::RuntimeError {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            BackendError::InvalidInput(_) => ErrorKind::InvalidInput,
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            BackendError::RuntimeError { .. } => ErrorKind::RuntimeError,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // Identity
    #[error("No VMID mapping for container: {0}")]
    MappingNotFound(String),

    #[error("VMID range exhausted: every id in [{min}, {max}] is in use")]
    VmidExhausted { min: u32, max: u32 },

    #[error("VMID {vmid} is already mapped to container {owner}")]
    VmidConflict { vmid: u32, owner: String },

    #[error("VMID store is corrupt: {0}")]
    StoreCorrupt(String),

    // Routing
    #[error("No backend matches container {0} and no default runtime is configured")]
    NoMatchingBackend(String),

    // Lifecycle
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Invalid state: container {id} is {current}, expected {expected}")]
    InvalidContainerState {
        id: String,
        current: String,
        expected: String,
    },

    #[error("Invalid container id: {0}")]
    InvalidContainerId(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Container {id} did not stop within {waited:?}")]
    StopTimedOut { id: String, waited: Duration },

    #[error("Command in container {id} timed out after {timeout:?}")]
    CommandTimeout { id: String, timeout: Duration },

    // Backend
    #[error("{backend} backend: {source}")]
    Backend {
        backend: BackendKind,
        #[source]
        source: BackendError,
    },

    // Ambient
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable, caller-visible classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MappingNotFound,
    VmidExhausted,
    VmidConflict,
    StoreCorrupt,
    NoMatchingBackend,
    ContainerNotFound,
    ContainerAlreadyExists,
    InvalidContainerState,
    InvalidContainerId,
    InvalidArgument,
    StopTimedOut,
    CommandTimeout,
    NotFound,
    PermissionDenied,
    InvalidInput,
    Timeout,
    UnsupportedOperation,
    RuntimeError,
    Config,
    Io,
    Serialization,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MappingNotFound => "MappingNotFound",
            ErrorKind::VmidExhausted => "VmidExhausted",
            ErrorKind::VmidConflict => "VmidConflict",
            ErrorKind::StoreCorrupt => "StoreCorrupt",
            ErrorKind::NoMatchingBackend => "NoMatchingBackend",
            ErrorKind::ContainerNotFound => "ContainerNotFound",
            ErrorKind::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorKind::InvalidContainerState => "InvalidContainerState",
            ErrorKind::InvalidContainerId => "InvalidContainerId",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::StopTimedOut => "StopTimedOut",
            ErrorKind::CommandTimeout => "CommandTimeout",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Config => "Config",
            ErrorKind::Io => "Io",
            ErrorKind::Serialization => "Serialization",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn backend(backend: BackendKind, source: BackendError) -> Self {
        Error::Backend { backend, source }
    }

    pub fn invalid_state(id: &str, current: impl ToString, expected: impl Into<String>) -> Self {
        Error::InvalidContainerState {
            id: id.to_string(),
            current: current.to_string(),
            expected: expected.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MappingNotFound(_) => ErrorKind::MappingNotFound,
            Error::VmidExhausted { .. } => ErrorKind::VmidExhausted,
            Error::VmidConflict { .. } => ErrorKind::VmidConflict,
            Error::StoreCorrupt(_) => ErrorKind::StoreCorrupt,
            Error::NoMatchingBackend(_) => ErrorKind::NoMatchingBackend,
            Error::ContainerNotFound(_) => ErrorKind::ContainerNotFound,
            Error::ContainerAlreadyExists(_) => ErrorKind::ContainerAlreadyExists,
            Error::InvalidContainerState { .. } => ErrorKind::InvalidContainerState,
            Error::InvalidContainerId(_) => ErrorKind::InvalidContainerId,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::StopTimedOut { .. } => ErrorKind::StopTimedOut,
            Error::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            Error::Backend { source, .. } => source.kind(),
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) | Error::Toml(_) => ErrorKind::Serialization,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The backend error wrapped by this error, if any
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Error::Backend { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_kind_passes_through() {
        let err = Error::backend(BackendKind::Crun, BackendError::Timeout(Duration::from_secs(3)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.kind().as_str(), "Timeout");
        assert!(err.to_string().starts_with("crun backend"));
    }

    #[test]
    fn test_runtime_error_display_includes_exit_code() {
        let err = BackendError::RuntimeError {
            message: "lxc-start: failed".into(),
            exit_code: Some(1),
        };
        assert_eq!(err.to_string(), "runtime error (exit code 1): lxc-start: failed");
        assert_eq!(BackendError::runtime("boom").to_string(), "runtime error: boom");
    }

    #[test]
    fn test_lifecycle_kinds() {
        assert_eq!(Error::ContainerNotFound("x".into()).kind(), ErrorKind::ContainerNotFound);
        assert_eq!(
            Error::invalid_state("x", "stopped", "running").kind(),
            ErrorKind::InvalidContainerState
        );
        assert_eq!(
            Error::StopTimedOut { id: "x".into(), waited: Duration::from_secs(30) }.kind(),
            ErrorKind::StopTimedOut
        );
    }
}
