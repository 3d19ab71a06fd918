//! Error types for slotwise.
//!
//! This module defines all error types used throughout the slotwise crate.
//! Protocol failures map onto a stable [`ReasonCode`] that is reported to the
//! update server, and every error renders as a JSON body when it crosses the
//! HTTP boundary.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::hash::ContentHash;
use crate::model::ReasonCode;

/// Stable, machine-readable error codes returned by the HTTP APIs.
///
/// Clients match on `code` from `{"code": "CHANNEL_UNKNOWN", "message": "..."}`.
#[allow(missing_docs)]
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CHANNEL_UNKNOWN: &str = "CHANNEL_UNKNOWN";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const INTEGRITY_VIOLATION: &str = "INTEGRITY_VIOLATION";
    pub const SIGNATURE_INVALID: &str = "SIGNATURE_INVALID";
    pub const PATCH_INCOMPATIBLE: &str = "PATCH_INCOMPATIBLE";
    pub const RANGE_NOT_SATISFIABLE: &str = "RANGE_NOT_SATISFIABLE";
    pub const INVALID_STATE: &str = "INVALID_STATE";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

/// The main error type for slotwise operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Registry Errors ===
    /// The requested channel does not exist.
    #[error("unknown channel '{channel}'")]
    ChannelUnknown {
        /// Channel name from the request.
        channel: String,
    },

    /// A release, device, session or package was not found.
    #[error("{what} not found")]
    NotFound {
        /// Human readable description of the missing entity.
        what: String,
    },

    /// A release with this version already exists in the channel.
    #[error("release {version} already exists in channel '{channel}'")]
    ReleaseExists {
        /// Channel name.
        channel: String,
        /// Duplicate version.
        version: String,
    },

    // === Integrity Errors ===
    /// Content hash of stored or received bytes does not match the declared hash.
    #[error("integrity violation: expected {expected}, got {actual}")]
    IntegrityViolation {
        /// The declared hash.
        expected: ContentHash,
        /// The hash of the bytes actually seen.
        actual: ContentHash,
    },

    /// A manifest or package signature did not verify against the trusted keys.
    #[error("signature invalid: {reason}")]
    SignatureInvalid {
        /// Why verification failed.
        reason: String,
    },

    /// The base artifact does not match the source hash a patch was built from.
    #[error("patch incompatible: patch expects base {expected}, got {actual}")]
    PatchIncompatible {
        /// Source hash declared by the patch.
        expected: ContentHash,
        /// Hash of the base that was supplied.
        actual: ContentHash,
    },

    /// A patch could not be decoded.
    #[error("malformed patch: {0}")]
    PatchMalformed(String),

    /// A byte range outside the artifact was requested.
    #[error("range {offset}+{len} not satisfiable for artifact of {size} bytes")]
    RangeNotSatisfiable {
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Artifact size.
        size: u64,
    },

    // === Agent Errors ===
    /// A transient network failure; retryable with backoff.
    #[error("network failure: {message}")]
    NetworkFailure {
        /// Description of what went wrong.
        message: String,
    },

    /// Not enough local storage for the package.
    #[error("insufficient storage: need {required} bytes, budget is {available}")]
    InsufficientStorage {
        /// Bytes needed.
        required: u64,
        /// Bytes available.
        available: u64,
    },

    /// The slot swap or activation could not complete.
    #[error("apply failed: {message}")]
    ApplyFailure {
        /// Description of what went wrong.
        message: String,
    },

    /// No health signal arrived within the confirmation window.
    #[error("confirmation window elapsed without a health signal")]
    ConfirmationTimeout,

    /// The operation was cancelled before anything touched the running system.
    #[error("update cancelled")]
    Cancelled,

    /// The agent is not in a state that allows the requested operation.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Current state name.
        state: String,
        /// Requested operation.
        operation: &'static str,
    },

    /// Input data is invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for slotwise operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkFailure {
            message: err.to_string(),
        }
    }
}

impl From<semver::Error> for Error {
    fn from(err: semver::Error) -> Self {
        Self::Validation(format!("invalid version: {err}"))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a network failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }

    /// Create a signature failure.
    #[must_use]
    pub fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            reason: reason.into(),
        }
    }

    /// Create an apply failure.
    #[must_use]
    pub fn apply(message: impl Into<String>) -> Self {
        Self::ApplyFailure {
            message: message.into(),
        }
    }

    /// Only network failures are retried in place.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure { .. })
    }

    /// Integrity and signature failures trigger a fresh resolve and download.
    #[must_use]
    pub fn requires_redownload(&self) -> bool {
        matches!(
            self,
            Self::IntegrityViolation { .. } | Self::SignatureInvalid { .. }
        )
    }

    /// The reason code reported to the server for this failure, if any.
    #[must_use]
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::ChannelUnknown { .. } => Some(ReasonCode::ChannelUnknown),
            Self::IntegrityViolation { .. } => Some(ReasonCode::IntegrityViolation),
            Self::SignatureInvalid { .. } => Some(ReasonCode::SignatureInvalid),
            Self::PatchIncompatible { .. } | Self::PatchMalformed(_) => {
                Some(ReasonCode::PatchIncompatible)
            }
            Self::NetworkFailure { .. } | Self::RangeNotSatisfiable { .. } => {
                Some(ReasonCode::NetworkFailure)
            }
            Self::NotFound { .. } => Some(ReasonCode::PackageUnavailable),
            Self::InsufficientStorage { .. } => Some(ReasonCode::InsufficientStorage),
            Self::ApplyFailure { .. } => Some(ReasonCode::ApplyFailure),
            Self::ConfirmationTimeout => Some(ReasonCode::ConfirmationTimeout),
            Self::Cancelled => Some(ReasonCode::Cancelled),
            _ => None,
        }
    }

    /// Reason code for a failure that ends an update session.
    ///
    /// Errors without a protocol meaning came from the server side of the
    /// exchange, so they count as network failures.
    #[must_use]
    pub fn session_reason(&self) -> ReasonCode {
        self.reason_code().unwrap_or(ReasonCode::NetworkFailure)
    }

    /// Stable, machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => error_code::NOT_FOUND,
            Self::ChannelUnknown { .. } => error_code::CHANNEL_UNKNOWN,
            Self::ReleaseExists { .. } => error_code::ALREADY_EXISTS,
            Self::Validation(_) | Self::ConfigValidation { .. } | Self::PatchMalformed(_) => {
                error_code::VALIDATION_FAILED
            }
            Self::IntegrityViolation { .. } => error_code::INTEGRITY_VIOLATION,
            Self::SignatureInvalid { .. } => error_code::SIGNATURE_INVALID,
            Self::PatchIncompatible { .. } => error_code::PATCH_INCOMPATIBLE,
            Self::RangeNotSatisfiable { .. } => error_code::RANGE_NOT_SATISFIABLE,
            Self::InvalidState { .. } => error_code::INVALID_STATE,
            Self::NetworkFailure { .. } => error_code::UNAVAILABLE,
            Self::DatabaseOpen { .. }
            | Self::DatabaseQuery(_)
            | Self::DatabaseMigration { .. }
            | Self::Io(_)
            | Self::DirectoryCreate { .. } => error_code::STORAGE_ERROR,
            _ => error_code::INTERNAL,
        }
    }

    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } | Self::ChannelUnknown { .. } => StatusCode::NOT_FOUND,
            Self::ReleaseExists { .. } | Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::Validation(_) | Self::ConfigValidation { .. } | Self::PatchMalformed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::IntegrityViolation { .. }
            | Self::SignatureInvalid { .. }
            | Self::PatchIncompatible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::NetworkFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.error_code(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConfirmationTimeout;
        assert_eq!(
            err.to_string(),
            "confirmation window elapsed without a health signal"
        );

        let err = Error::internal("test error");
        assert_eq!(err.to_string(), "internal error: test error");
    }

    #[test]
    fn test_only_network_failures_are_retryable() {
        assert!(Error::network("reset").is_retryable());
        assert!(!Error::signature("bad").is_retryable());
        assert!(!Error::apply("disk").is_retryable());
    }

    #[test]
    fn test_integrity_and_signature_require_redownload() {
        let integrity = Error::IntegrityViolation {
            expected: ContentHash::of(b"a"),
            actual: ContentHash::of(b"b"),
        };
        assert!(integrity.requires_redownload());
        assert!(Error::signature("bad").requires_redownload());
        assert!(!Error::network("reset").requires_redownload());
    }

    #[test]
    fn test_reason_code_mapping() {
        assert_eq!(
            Error::ChannelUnknown {
                channel: "nightly".into()
            }
            .reason_code(),
            Some(ReasonCode::ChannelUnknown)
        );
        assert_eq!(
            Error::ConfirmationTimeout.reason_code(),
            Some(ReasonCode::ConfirmationTimeout)
        );
        assert_eq!(
            Error::InsufficientStorage {
                required: 10,
                available: 1
            }
            .reason_code(),
            Some(ReasonCode::InsufficientStorage)
        );
        assert_eq!(Error::internal("bug").reason_code(), None);
        assert_eq!(
            Error::not_found("package").reason_code(),
            Some(ReasonCode::PackageUnavailable)
        );
    }

    #[test]
    fn test_session_reason_defaults_to_network_failure() {
        assert_eq!(
            Error::validation("bad request").session_reason(),
            ReasonCode::NetworkFailure
        );
        assert_eq!(
            Error::internal("server bug").session_reason(),
            ReasonCode::NetworkFailure
        );
        assert_eq!(
            Error::signature("forged").session_reason(),
            ReasonCode::SignatureInvalid
        );
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            Error::not_found("release").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ChannelUnknown {
                channel: "x".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::RangeNotSatisfiable {
                offset: 10,
                len: 1,
                size: 5
            }
            .status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            Error::internal("bug").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            Error::ChannelUnknown {
                channel: "x".into()
            }
            .error_code(),
            "CHANNEL_UNKNOWN"
        );
        assert_eq!(Error::signature("x").error_code(), "SIGNATURE_INVALID");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_semver_error() {
        let err: Error = semver::Version::parse("not-a-version").unwrap_err().into();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }
}
