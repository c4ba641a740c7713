//! Error types for the converge engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration and graph building, state storage, planning, and provider
//! calls made during apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// All of these abort a run before any provider call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two resource instances expanded to the same address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected between: {}", addresses.join(", "))]
    CircularDependency {
        /// Every address participating in the cycle.
        addresses: Vec<String>,
    },

    /// An expression or `depends_on` entry names a resource that does not exist.
    #[error("Resource {from} references unknown resource {target}")]
    UnknownReference {
        /// Address of the referring instance.
        from: String,
        /// The reference as written.
        target: String,
    },

    /// An attribute expression could not be parsed or bound.
    #[error("Invalid expression in {location}: {message}")]
    InvalidExpression {
        /// Where the expression appears.
        location: String,
        /// Description of the problem.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A live lock is already held on the snapshot.
    #[error("State is locked by {holder} (lock ID: {lock_id}, since: {since})")]
    LockHeld {
        /// Identifier of the existing lock.
        lock_id: String,
        /// Identity of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The caller's lock is missing, expired, or belongs to someone else.
    #[error("Lock {lock_id} is not valid: {reason}")]
    LockInvalid {
        /// The lock the caller presented.
        lock_id: String,
        /// Why the lock was rejected.
        reason: String,
    },

    /// The snapshot was replaced out-of-band.
    #[error("State lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch {
        /// Lineage the caller expected.
        expected: String,
        /// Lineage currently stored.
        found: String,
    },

    /// The stored serial advanced since the caller read the snapshot.
    #[error("State serial conflict: write based on serial {expected}, store is at {found}")]
    SerialConflict {
        /// Serial the write was based on.
        expected: u64,
        /// Serial currently stored.
        found: u64,
    },

    /// No record exists at the given address.
    #[error("No resource recorded at {address}")]
    AddressNotFound {
        /// The missing address.
        address: String,
    },

    /// A record already exists at the given address.
    #[error("A resource is already recorded at {address}")]
    AddressOccupied {
        /// The occupied address.
        address: String,
    },

    /// A requested snapshot version is not retained.
    #[error("State version {serial} not found")]
    VersionNotFound {
        /// The missing serial.
        serial: u64,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Backend storage error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Planning errors.
///
/// Any of these aborts the run before apply begins.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A plan would destroy a resource protected by `prevent_destroy`.
    #[error("Resource {address} has prevent_destroy set but the plan would destroy it")]
    PreventDestroy {
        /// The protected address.
        address: String,
    },

    /// The snapshot changed since the plan was computed.
    #[error("Plan is stale: computed against {planned}, state is now {current}")]
    StalePlan {
        /// Lineage/serial the plan was computed against.
        planned: String,
        /// Lineage/serial currently stored.
        current: String,
    },

    /// No provider is registered for a resource.
    #[error("No provider '{provider}' registered for resource {address}")]
    MissingProvider {
        /// The provider name.
        provider: String,
        /// Address that needs it.
        address: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Errors reported by a provider for a single operation.
///
/// These are local to one action: the executor records them and skips the
/// action's dependents instead of aborting the run.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The external object does not exist.
    #[error("External object not found: {external_id}")]
    NotFound {
        /// Identifier that was looked up.
        external_id: String,
    },

    /// The provider rejected or failed the operation.
    #[error("{operation} failed: {message}")]
    OperationFailed {
        /// Operation name (create, read, update, destroy).
        operation: String,
        /// Description from the provider.
        message: String,
    },

    /// The operation exceeded its timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Timeout that elapsed.
        timeout: std::time::Duration,
    },

    /// The provider does not manage this resource type.
    #[error("Resource type {resource_type} is not supported")]
    UnsupportedType {
        /// The unsupported type.
        resource_type: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

/// Result type alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if re-running the whole pipeline later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::LockHeld { .. } | StateError::SerialConflict { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::State(StateError::LockHeld { .. }) => Some(5),
            Self::State(StateError::SerialConflict { .. }) => Some(1),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid expression error.
    #[must_use]
    pub fn expression(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a lock-invalid error.
    #[must_use]
    pub fn lock_invalid(lock_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LockInvalid {
            lock_id: lock_id.into(),
            reason: reason.into(),
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(external_id: impl Into<String>) -> Self {
        Self::NotFound {
            external_id: external_id.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns true if the external object is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
