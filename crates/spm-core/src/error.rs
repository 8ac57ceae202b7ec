//! Error types for spm-core with categorization:
//!
//! - **Validation errors**: bad chain membership, shared merge targets, missing
//!   metadata keys, bad configuration (exit code 1)
//! - **System errors**: I/O, lease subsystem, external tools (exit code 2)
//! - **Not found / role errors**: unknown domain, host is not SPM (exit code 3)
//! - **State errors**: unexpected volume state, metadata overflow (exit code 4)
//!
//! Structural and state errors are never retried by this crate. I/O and
//! lease-transient failures are retried inside the cluster lock, and only the
//! final failing attempt surfaces here.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    ids::{DomainId, ImageId, VolumeId},
    volume::Legality,
};

/// Coarse error classification used for exit codes and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    StateConsistency,
    Overflow,
    Lock,
    Io,
    Config,
    Job,
}

/// Core error type for spm-core operations.
#[derive(Debug, Error)]
pub enum Error {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // METADATA
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    /// A required key was absent from a metadata block.
    #[error("Missing metadata key: {key}: found: {found:?}")]
    MetadataKeyMissing {
        key: &'static str,
        found: BTreeMap<String, String>,
    },

    /// A metadata value could not be interpreted.
    #[error("Invalid metadata value for {key}: '{value}'")]
    InvalidMetadata { key: String, value: String },

    /// Serialized metadata does not fit the fixed block.
    #[error("Metadata overflow: {size} bytes exceeds block size {limit}")]
    MetadataOverflow { size: usize, limit: usize },

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // MERGE
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Volume is not in chain: domain={domain} image={image} volume={volume}")]
    VolumeNotInChain {
        domain: DomainId,
        image: ImageId,
        volume: VolumeId,
    },

    #[error("Wrong parent volume: base={base} is not an ancestor of top={top}")]
    WrongParentVolume { base: VolumeId, top: VolumeId },

    #[error("Shared volume is non writable: {volume}")]
    SharedVolumeNonWritable { volume: VolumeId },

    #[error("Unexpected volume state for {volume}: expected {expected}, found {actual}")]
    UnexpectedVolumeState {
        volume: VolumeId,
        expected: Legality,
        actual: Legality,
    },

    #[error("Generation mismatch for {volume}: expected {expected}, found {actual}")]
    GenerationMismatch {
        volume: VolumeId,
        expected: u64,
        actual: u64,
    },

    #[error("Unknown storage domain: {0}")]
    UnknownDomain(DomainId),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // CLUSTER LOCK
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Cannot initialize cluster lock for domain {domain}: {reason}")]
    InitLockFailure { domain: DomainId, reason: String },

    #[error("Cannot acquire host id for domain {domain}: {reason}")]
    AcquireHostIdFailure { domain: DomainId, reason: String },

    #[error("Cannot release host id for domain {domain}: {reason}")]
    ReleaseHostIdFailure { domain: DomainId, reason: String },

    #[error("Cannot obtain lock for domain {domain}: {reason}")]
    AcquireLockFailure { domain: DomainId, reason: String },

    #[error("Cannot release lock for domain {domain}: {reason}")]
    ReleaseLockFailure { domain: DomainId, reason: String },

    #[error("Host is not SPM for domain {0}")]
    NotSpm(DomainId),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // RESOURCE MANAGER
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Lock order violation: {requested} requested after {held}")]
    LockOrderViolation { held: String, requested: String },

    #[error("Timed out acquiring resource {0}")]
    ResourceTimeout(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // JOBS AND EXTERNAL TOOLS
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Command '{command}' failed (exit code: {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Job {0} was cancelled")]
    Cancelled(String),

    #[error("Job {0} is committing and cannot be cancelled")]
    CommitInProgress(String),

    #[error("Job {0} has already finished")]
    JobFinished(String),

    #[error("Job {0} is already running")]
    JobRunning(String),

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // AMBIENT
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid {kind}: '{value}'")]
    InvalidId { kind: &'static str, value: String },

    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type alias for spm-core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with context.
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::IoError(format!("{context}: {err}"))
    }

    pub fn acquire_lock_failure(domain: DomainId, reason: impl Into<String>) -> Self {
        Self::AcquireLockFailure {
            domain,
            reason: reason.into(),
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::MetadataKeyMissing { .. }
            | Self::InvalidMetadata { .. }
            | Self::VolumeNotInChain { .. }
            | Self::WrongParentVolume { .. }
            | Self::SharedVolumeNonWritable { .. }
            | Self::GenerationMismatch { .. }
            | Self::UnknownDomain(_)
            | Self::InvalidId { .. } => ErrorCategory::Validation,
            Self::UnexpectedVolumeState { .. } => ErrorCategory::StateConsistency,
            Self::MetadataOverflow { .. } => ErrorCategory::Overflow,
            Self::InitLockFailure { .. }
            | Self::AcquireHostIdFailure { .. }
            | Self::ReleaseHostIdFailure { .. }
            | Self::AcquireLockFailure { .. }
            | Self::ReleaseLockFailure { .. }
            | Self::NotSpm(_)
            | Self::LockOrderViolation { .. }
            | Self::ResourceTimeout(_) => ErrorCategory::Lock,
            Self::CommandFailed { .. } | Self::IoError(_) => ErrorCategory::Io,
            Self::InvalidConfig(_) => ErrorCategory::Config,
            Self::Cancelled(_)
            | Self::CommitInProgress(_)
            | Self::JobFinished(_)
            | Self::JobRunning(_) => {
                ErrorCategory::Job
            }
        }
    }

    /// Whether a caller may retry the same operation without operator action.
    ///
    /// A retry never clears an ILLEGAL marker on its own; it only re-runs the
    /// step that failed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IoError(_)
                | Self::CommandFailed { .. }
                | Self::ResourceTimeout(_)
                | Self::AcquireLockFailure { .. }
        )
    }

    /// Returns the appropriate exit code for this error type.
    ///
    /// Exit code scheme:
    /// - 1: validation or configuration error
    /// - 2: system error (IO, lease subsystem, external commands)
    /// - 3: not found or wrong role
    /// - 4: invalid state (volume state, metadata overflow)
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownDomain(_) | Self::NotSpm(_) => 3,
            _ => match self.category() {
                ErrorCategory::Validation | ErrorCategory::Config => 1,
                ErrorCategory::StateConsistency | ErrorCategory::Overflow => 4,
                ErrorCategory::Lock | ErrorCategory::Io | ErrorCategory::Job => 2,
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(format!("Failed to parse config: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_names_key_and_found_set() {
        let mut found = BTreeMap::new();
        found.insert("DOMAIN".to_string(), "x".to_string());
        let err = Error::MetadataKeyMissing {
            key: "IMAGE",
            found,
        };
        let display = err.to_string();
        assert!(display.contains("Missing metadata key: IMAGE"));
        assert!(display.contains("DOMAIN"));
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        let vol = VolumeId::new();
        let errs = [
            Error::WrongParentVolume {
                base: vol,
                top: vol,
            },
            Error::SharedVolumeNonWritable { volume: vol },
            Error::UnexpectedVolumeState {
                volume: vol,
                expected: Legality::Illegal,
                actual: Legality::Legal,
            },
            Error::MetadataOverflow {
                size: 600,
                limit: 512,
            },
        ];
        for err in errs {
            assert!(!err.is_retryable(), "{err} must not be retryable");
        }
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow storage",
        ));
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_exit_codes() {
        let vol = VolumeId::new();
        assert_eq!(Error::SharedVolumeNonWritable { volume: vol }.exit_code(), 1);
        assert_eq!(Error::InvalidConfig("x".into()).exit_code(), 1);
        assert_eq!(Error::IoError("x".into()).exit_code(), 2);
        assert_eq!(Error::NotSpm(DomainId::new()).exit_code(), 3);
        assert_eq!(
            Error::UnexpectedVolumeState {
                volume: vol,
                expected: Legality::Illegal,
                actual: Legality::Legal,
            }
            .exit_code(),
            4
        );
        assert_eq!(
            Error::MetadataOverflow {
                size: 1,
                limit: 0
            }
            .exit_code(),
            4
        );
    }
}
