//! Error taxonomy for physical storage operations.
//!
//! Every backend, middleware and lock returns [`PhysicalError`]. Not-found
//! conditions are never errors: drivers map them to `Ok(None)` or `Ok(())`.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by physical storage operations.
#[derive(Debug, Error)]
pub enum PhysicalError {
    /// Value exceeds the driver's configured maximum.
    #[error("put failed due to value being too large; got {size} bytes, max: {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    /// Key exceeds the driver's configured maximum.
    #[error("put failed due to key being too large; got {size} bytes, max: {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    /// Key contains a `..` component.
    #[error("path cannot contain parent references")]
    PathContainsParentReferences,

    /// A view received a key that would escape its prefix.
    #[error("relative paths not supported: {path}")]
    RelativePath { path: String },

    /// The call context was canceled before the operation committed.
    #[error("context canceled")]
    Canceled,

    /// Operation rejected by a fault toggle or injector.
    #[error("operation disabled: {operation}")]
    OperationDisabled { operation: String },

    /// Native transactional store rejected the commit due to a concurrent change.
    #[error("transaction conflict: {message}")]
    TransactionConflict { message: String },

    /// Key contains a character the encoding layer refuses to store.
    #[error("key contains non-printable characters: {key:?}")]
    NonPrintableKey { key: String },

    /// Stored checksum does not match the value read back.
    #[error("checksum mismatch for key {key}")]
    ChecksumMismatch { key: String },

    /// `Lock` called on a handle that already holds the lock.
    #[error("lock already held")]
    LockAlreadyHeld,

    /// Write rejected because the registered active-node lock is no longer ours.
    #[error("write fenced: {reason}")]
    Fenced { reason: String },

    /// The backend does not offer the requested capability.
    #[error("{operation} is not supported by this backend")]
    Unsupported { operation: String },

    /// Driver configuration is missing or malformed.
    #[error("invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    /// A transaction failed; carries the cause and any rollback failures.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// A coalesced batch failed; every submitter receives the shared cause.
    #[error("batched write failed: {source}")]
    Batch {
        #[source]
        source: Arc<PhysicalError>,
    },

    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped driver-specific error.
    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl PhysicalError {
    /// Create a Backend error from a message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a native driver error, keeping it as the source.
    pub fn backend_from<E>(context: &str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            message: format!("{}: {}", context, err),
            source: Some(Box::new(err)),
        }
    }

    /// Create an OperationDisabled error.
    pub fn disabled(operation: impl Into<String>) -> Self {
        Self::OperationDisabled {
            operation: operation.into(),
        }
    }

    /// Create a Config error.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an Unsupported error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Check if the caller may retry the operation unchanged.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransactionConflict { .. } => true,
            Self::Batch { source } => source.is_retriable(),
            Self::Transaction(err) => err.cause.is_retriable(),
            _ => false,
        }
    }

    /// Check if this error reports cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Batch { source } => source.is_canceled(),
            Self::Transaction(err) => err.cause.is_canceled(),
            _ => false,
        }
    }
}

/// Result type using PhysicalError.
pub type PhysicalResult<T> = Result<T, PhysicalError>;

// ============================================================================
// Composite transaction error
// ============================================================================

/// Failure of a transaction: the forward-walk cause plus compensation failures.
#[derive(Debug)]
pub struct TransactionError {
    /// The error that aborted the forward walk.
    pub cause: Box<PhysicalError>,
    /// Errors from compensating operations, in the order they were attempted.
    pub rollback_errors: Vec<PhysicalError>,
}

impl TransactionError {
    pub fn new(cause: PhysicalError) -> Self {
        Self {
            cause: Box::new(cause),
            rollback_errors: Vec::new(),
        }
    }

    /// True if every compensating operation succeeded.
    pub fn rolled_back_cleanly(&self) -> bool {
        self.rollback_errors.is_empty()
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction failed: {}", self.cause)?;
        if !self.rollback_errors.is_empty() {
            write!(f, "; rollback failed:")?;
            for (i, err) in self.rollback_errors.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                write!(f, " {}", err)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}
