//! Error types for the weft runtime
//!
//! Protocol errors (caller misused an instance) and content errors (the
//! activity tree is invalid) are kept apart. Validation findings are data,
//! not errors, until a caller converts them into an [`InvalidWorkflowError`].

use std::io;
use thiserror::Error;
use uuid::Uuid;

use super::validation::constraint::ConstraintFault;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Structural or constraint violations, aggregated into one message
    #[error(transparent)]
    InvalidWorkflow(#[from] InvalidWorkflowError),

    /// Malformed call (bad settings, bad root inputs, ...)
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    /// Protocol violation against a workflow instance
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Failure reported by the execution engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Failure reported by the instance store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A constraint failed in a way that must not be contained
    #[error("Fatal constraint failure: {0}")]
    FatalConstraint(#[from] ConstraintFault),

    /// A cancellation token fired while walking the tree
    #[error("The operation was cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    /// The protocol error carried by this error, if any
    pub fn as_operation(&self) -> Option<&OperationError> {
        match self {
            RuntimeError::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// Aggregated validation failure, message bounded to 4096 characters
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct InvalidWorkflowError {
    /// Full exception text (preamble plus one line per violation)
    pub message: String,
}

impl InvalidWorkflowError {
    /// Wrap a pre-rendered exception string
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A call was made with arguments the runtime cannot accept
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (parameter '{param}')")]
pub struct ArgumentError {
    /// Name of the offending parameter
    pub param: String,
    /// Description of the problem
    pub message: String,
}

impl ArgumentError {
    /// Create a new argument error
    pub fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

/// Protocol errors raised by the instance controller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Another operation holds the instance's operation lock
    #[error("An operation is already in progress on this workflow instance")]
    OperationInProgress,

    /// The execution engine is mid-run
    #[error("The workflow runtime is already running")]
    RuntimeRunning,

    /// The instance has been aborted
    #[error("The workflow instance has been aborted: {0}")]
    Aborted(String),

    /// Bookmark resumption requires an idle instance
    #[error("The workflow instance must be idle for this operation")]
    NotIdle,

    /// The instance has not been initialized yet
    #[error("The workflow instance has not been initialized")]
    NotInitialized,

    /// The instance was already initialized
    #[error("The workflow instance has already been initialized")]
    AlreadyInitialized,

    /// The instance cannot be persisted in its current state
    #[error("The workflow instance is not in a persistable state")]
    NotPersistable,
}

/// Convenience result alias for controller operations
pub type OperationResult<T> = std::result::Result<T, OperationError>;

/// Errors surfaced by an execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not honour the request in its current state
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// The persisted state belongs to a different workflow definition
    #[error("Snapshot was taken from definition {expected}, not {found}")]
    DefinitionMismatch {
        /// Fingerprint recorded in the snapshot
        expected: String,
        /// Fingerprint of the definition being rehydrated
        found: String,
    },

    /// The snapshot belongs to another instance
    #[error("Snapshot belongs to instance {found}, expected {expected}")]
    InstanceMismatch {
        /// Instance the snapshot is being loaded into
        expected: Uuid,
        /// Instance id recorded in the snapshot
        found: Uuid,
    },

    /// Engine state could not be (de)serialized
    #[error("Engine state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Instance store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No snapshot exists for the instance
    #[error("Instance {0} not found in store")]
    NotFound(Uuid),

    /// Backend failure (filesystem, encoding)
    #[error("Store backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
