//! Error types for StrideLLM
//!
//! Errors fall into three classes that callers treat differently:
//! capacity errors are recoverable and reported per request, integration
//! errors abort the current tick, and transient errors are retried.

use crate::types::{SequenceId, SequenceState, TokenId, WorkerId};
use thiserror::Error;

/// Result type alias for StrideLLM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for StrideLLM
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Not enough free cache blocks to satisfy an acquisition
    #[error("Out of cache capacity: requested {requested} blocks, {available} free")]
    OutOfCapacity {
        /// Blocks the operation needed
        requested: usize,
        /// Blocks that were free
        available: usize,
    },

    /// Tenant exceeded its token budget for the current window
    #[error("Rate limit exceeded for tenant {tenant}: {requested} tokens requested, {remaining} remaining in window")]
    RateLimitExceeded {
        /// Tenant that was charged
        tenant: String,
        /// Tokens the submission asked for
        requested: usize,
        /// Tokens left in the current window
        remaining: usize,
    },

    /// Illegal sequence state transition
    #[error("Invalid state transition for sequence {sequence}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// Sequence whose transition was refused
        sequence: SequenceId,
        /// State the sequence was in
        from: SequenceState,
        /// State that was requested
        to: SequenceState,
    },

    /// A token outside the grammar mask was observed
    #[error("Grammar violation: token {token} not permitted{}", sequence.as_ref().map(|s| format!(" for sequence {s}")).unwrap_or_default())]
    GrammarViolation {
        /// Offending sequence, when known
        sequence: Option<SequenceId>,
        /// Token outside the mask
        token: TokenId,
    },

    /// Grammar definition could not be compiled
    #[error("Invalid grammar: {0}")]
    InvalidGrammar(String),

    /// Cross-worker migration failed
    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    /// Block accounting is inconsistent
    #[error("Cache invariant violated: {0}")]
    InvariantViolation(String),

    /// Sequence not known to this scheduler
    #[error("Sequence not found: {0}")]
    SequenceNotFound(SequenceId),

    /// Waiting queue or intake channel is full
    #[error("Request queue is full")]
    QueueFull,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed submission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// External compute step failed
    #[error("Compute step failed: {0}")]
    Compute(String),

    /// A plan is already waiting for its result
    #[error("Tick {0} is still in flight")]
    TickInProgress(u64),

    /// Result does not belong to the in-flight tick
    #[error("Stale step result: expected tick {expected}, got {actual}")]
    StaleTick {
        /// Tick currently in flight
        expected: u64,
        /// Tick the result claims
        actual: u64,
    },

    /// Compute step returned no output for a planned sequence
    #[error("Compute step returned no output for sequence {0}")]
    MissingOutput(SequenceId),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        /// What was being attempted
        context: String,
        /// Underlying error
        source: Box<Error>,
    },
}

/// Failures of a cross-worker migration. All are transient from the
/// scheduler's point of view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Target inbox is full
    #[error("target worker {0} is busy")]
    TargetBusy(WorkerId),

    /// Target has shut down
    #[error("target worker {0} is unreachable")]
    Unreachable(WorkerId),

    /// Target refused the payload
    #[error("target worker {worker} rejected sequence: {reason}")]
    Rejected {
        /// Worker that refused
        worker: WorkerId,
        /// Refusal message from the target
        reason: String,
    },

    /// Sequence is not in a state that can be moved
    #[error("sequence {0} cannot be migrated in its current state")]
    NotMigratable(SequenceId),

    /// Source and target are the same worker
    #[error("sequence already lives on worker {0}")]
    SameWorker(WorkerId),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl Error {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Innermost error beneath any added context
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Expected, recoverable shortage of capacity or budget
    pub fn is_capacity(&self) -> bool {
        matches!(
            self.root(),
            Error::OutOfCapacity { .. } | Error::RateLimitExceeded { .. } | Error::QueueFull
        )
    }

    /// Contract breach between components; aborts the current tick
    pub fn is_integration(&self) -> bool {
        matches!(
            self.root(),
            Error::GrammarViolation { .. }
                | Error::InvariantViolation(_)
                | Error::MissingOutput(_)
                | Error::StaleTick { .. }
        )
    }

    /// Operational failure that may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Error::Migration(_) | Error::Compute(_))
    }

    /// Block accounting is corrupt; continuing risks cross-sequence corruption
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Error::InvariantViolation(_))
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
