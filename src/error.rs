//! Error types for the vSphere XCOPY populator
//!
//! Provides structured error types for every component: the vCenter client,
//! the storage array adapters, the offload engine and the populator runner.
//! Each variant folds into one [`ErrorKind`], which is what lands in the CR
//! status and decides the process exit code.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for the error string written to the CR status.
pub const MAX_STATUS_MESSAGE_LEN: usize = 512;

/// Unified error type for the populator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid vmdk path {path:?}: {reason}")]
    InvalidVmdkPath { path: String, reason: String },

    #[error("Unknown storage vendor product {value:?}")]
    UnknownVendor { value: String },

    #[error("Missing required credential key {key}")]
    MissingCredential { key: String },

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    #[error("Authentication failed against {system}: {reason}")]
    Authentication { system: String, reason: String },

    // =========================================================================
    // vCenter / ESXi Errors
    // =========================================================================
    #[error("Virtual machine not found: {vm_id}")]
    VmNotFound { vm_id: String },

    #[error("Datastore not found: {datacenter}/{name}")]
    DatastoreNotFound { datacenter: String, name: String },

    #[error("No usable storage initiators on host {host}")]
    NoInitiators { host: String },

    #[error("esxcli {command} failed: {message}")]
    EsxCli { command: String, message: String },

    #[error("esxcli fault {fault_type}: {}", messages.join("; "))]
    EsxCliFault {
        fault_type: String,
        messages: Vec<String>,
    },

    #[error("vSphere SOAP call {operation} failed: {reason}")]
    Soap { operation: String, reason: String },

    #[error("Device {device} not visible on host after {attempts} rescans")]
    DeviceNotVisible { device: String, attempts: u32 },

    // =========================================================================
    // Storage Array Errors
    // =========================================================================
    #[error("LUN not found on {backend}: {identifier}")]
    LunNotFound { backend: String, identifier: String },

    #[error("Source disk cannot be resolved on {backend}: {reason}")]
    SourceUnresolvable { backend: String, reason: String },

    #[error("Mapping conflict on {backend} for {lun}: {reason}")]
    MappingConflict {
        backend: String,
        lun: String,
        reason: String,
    },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Offload Engine Errors
    // =========================================================================
    #[error("Clone failed after {attempts} attempts: {message}")]
    TransientCloneFailure { attempts: u32, message: String },

    #[error("Clone failed: {message}")]
    CloneFailed { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("Cleanup {operation} failed: {reason}")]
    Cleanup { operation: String, reason: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Host lease for {host} unavailable: {reason}")]
    LeaseUnavailable { host: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    XmlParse(#[from] roxmltree::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classification surfaced in the CR status and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
pub enum ErrorKind {
    /// Missing or invalid CR field
    Config,
    /// Missing Secret key
    Credentials,
    /// vCenter or array rejected the credentials
    Auth,
    /// VM, disk, PV or LUN not resolvable
    NotFound,
    /// Array refused to map the LUN
    MappingConflict,
    /// Retryable vendor message persisted past the retry budget
    Transient,
    /// Unmap or ReleaseSource failed
    Cleanup,
    /// Invocation was cancelled
    Cancelled,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "Config",
            ErrorKind::Credentials => "Credentials",
            ErrorKind::Auth => "Auth",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::MappingConflict => "MappingConflict",
            ErrorKind::Transient => "Transient",
            ErrorKind::Cleanup => "Cleanup",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

impl ErrorKind {
    /// Process exit code for an invocation that failed with this kind
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::Credentials => 3,
            _ => 1,
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::InvalidVmdkPath { .. }
            | Error::UnknownVendor { .. } => ErrorKind::Config,

            Error::MissingCredential { .. } => ErrorKind::Credentials,

            Error::Authentication { .. } => ErrorKind::Auth,

            Error::VmNotFound { .. }
            | Error::DatastoreNotFound { .. }
            | Error::NoInitiators { .. }
            | Error::DeviceNotVisible { .. }
            | Error::LunNotFound { .. }
            | Error::SourceUnresolvable { .. }
            | Error::ResourceNotFound { .. } => ErrorKind::NotFound,

            Error::MappingConflict { .. } => ErrorKind::MappingConflict,

            Error::TransientCloneFailure { .. } => ErrorKind::Transient,

            Error::Cleanup { .. } => ErrorKind::Cleanup,

            Error::Cancelled { .. } => ErrorKind::Cancelled,

            Error::Http(e) if is_auth_status(e.status()) => ErrorKind::Auth,

            _ => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Single-line, bounded message for the CR status.
    ///
    /// The output depends only on the error itself, so a retried pod that hits
    /// the same failure writes the same string.
    pub fn status_message(&self) -> String {
        let flat: String = self
            .to_string()
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        truncate_at_char_boundary(&flat, MAX_STATUS_MESSAGE_LEN).to_string()
    }
}

fn is_auth_status(status: Option<reqwest::StatusCode>) -> bool {
    matches!(
        status,
        Some(reqwest::StatusCode::UNAUTHORIZED) | Some(reqwest::StatusCode::FORBIDDEN)
    )
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Result type alias for the populator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::UnknownVendor {
            value: "netapp".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.exit_code(), 2);

        let err = Error::MissingCredential {
            key: "STORAGE_PASSWORD".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Credentials);
        assert_eq!(err.exit_code(), 3);

        let err = Error::SourceUnresolvable {
            backend: "primera3par".into(),
            reason: "no VVol support".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_transient() {
        let err = Error::TransientCloneFailure {
            attempts: 4,
            message: "reservation conflict".into(),
        };
        assert!(err.is_transient());

        let err = Error::CloneFailed {
            message: "I/O error".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_missing_credential_names_key() {
        let err = Error::MissingCredential {
            key: "STORAGE_PASSWORD".into(),
        };
        assert!(err.status_message().contains("STORAGE_PASSWORD"));
    }

    #[test]
    fn test_status_message_is_bounded_and_single_line() {
        let err = Error::EsxCli {
            command: "vmkfstools clone".into(),
            message: format!("line one\nline two {}", "é".repeat(600)),
        };
        let msg = err.status_message();
        assert!(msg.len() <= MAX_STATUS_MESSAGE_LEN);
        assert!(!msg.contains('\n'));
        assert_eq!(msg, err.status_message());
    }
}
