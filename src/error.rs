//! Error types for EddyDB

use thiserror::Error;

/// Result type for EddyDB operations
pub type Result<T> = std::result::Result<T, EddyError>;

/// Classification of errors by kind rather than concrete variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation invoked on a closed or uninitialized adapter
    NotInitialized,
    /// Missing entity by id (document, snapshot, branch, vector)
    NotFound,
    /// Dimension mismatch, invalid operator, malformed spec
    InvalidArgument,
    /// Unique-index violation, validation failure
    ConstraintViolation,
    /// Merge conflict unresolved by the caller
    ConcurrencyConflict,
    /// Backing store I/O failures eligible for retry
    Transient,
    /// Embedding-provider call failed
    Embedding,
    /// Everything else
    Internal,
}

/// EddyDB error types
#[derive(Error, Debug)]
pub enum EddyError {
    #[error("adapter not initialized: {0}")]
    NotInitialized(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("merge left {count} unresolved conflict(s)")]
    MergeConflicts { count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{op}: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<EddyError>,
    },
}

impl From<serde_json::Error> for EddyError {
    fn from(e: serde_json::Error) -> Self {
        EddyError::Serialization(e.to_string())
    }
}

impl EddyError {
    /// Missing-document helper
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EddyError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Attach the failing operation name
    pub fn in_op(self, op: &'static str) -> Self {
        match self {
            // Keep the innermost operation; re-wrapping would bury it.
            e @ EddyError::Op { .. } => e,
            e => EddyError::Op {
                op,
                source: Box::new(e),
            },
        }
    }

    /// Classify by kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            EddyError::NotInitialized(_) => ErrorKind::NotInitialized,
            EddyError::NotFound { .. } => ErrorKind::NotFound,
            EddyError::InvalidArgument(_) | EddyError::DimensionMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            EddyError::ConstraintViolation(_) | EddyError::ValidationFailed(_) => {
                ErrorKind::ConstraintViolation
            }
            EddyError::MergeConflicts { .. } => ErrorKind::ConcurrencyConflict,
            EddyError::Io(_) => ErrorKind::Transient,
            EddyError::Embedding(_) => ErrorKind::Embedding,
            EddyError::Op { source, .. } => source.kind(),
            _ => ErrorKind::Internal,
        }
    }

    /// Stable, opaque error code
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotInitialized => "E_NOT_INITIALIZED",
            ErrorKind::NotFound => "E_NOT_FOUND",
            ErrorKind::InvalidArgument => "E_INVALID_ARGUMENT",
            ErrorKind::ConstraintViolation => "E_CONSTRAINT",
            ErrorKind::ConcurrencyConflict => "E_CONFLICT",
            ErrorKind::Transient => "E_TRANSIENT",
            ErrorKind::Embedding => "E_EMBEDDING",
            ErrorKind::Internal => "E_INTERNAL",
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
