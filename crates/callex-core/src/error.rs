//! Ledger error types.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Boxed underlying cause carried by [`LedgerError::Internal`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a missing event was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLookup {
    /// Lookup by event identifier.
    Id(Uuid),
    /// Lookup by ledger position.
    Sequence(u64),
}

impl fmt::Display for EventLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Sequence(sequence) => write!(f, "sequence {sequence}"),
        }
    }
}

/// Top-level ledger error type.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A malformed event or query. Nothing was written.
    #[error("validation error: {message}")]
    Validation {
        /// Position of the offending event inside a batch, if any.
        index: Option<usize>,
        /// What was wrong.
        message: String,
    },

    /// A sequence or id collision with a concurrent writer.
    #[error("conflict: {message}")]
    Conflict {
        /// The contested sequence number, when known.
        sequence: Option<u64>,
        /// What collided.
        message: String,
    },

    /// No event matched the lookup.
    #[error("event not found: {0}")]
    NotFound(EventLookup),

    /// The allocator reached its ceiling.
    #[error("sequence space exhausted after {latest}")]
    SequenceExhausted {
        /// The last sequence number handed out.
        latest: u64,
    },

    /// The event already carries a hash and may not be sealed again.
    #[error("event {0} is immutable: hash already computed")]
    Immutable(Uuid),

    /// An operation did not finish before its deadline.
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout {
        /// Name of the operation that was cut off.
        operation: &'static str,
        /// The deadline that elapsed, in milliseconds.
        after_ms: u64,
    },

    /// A storage or serialization failure.
    #[error("internal error: {message}")]
    Internal {
        /// Context describing what was attempted.
        message: String,
        /// The underlying cause.
        #[source]
        source: BoxError,
    },
}

impl LedgerError {
    /// Builds a validation error that is not tied to a batch position.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            index: None,
            message: message.into(),
        }
    }

    /// Builds an internal error wrapping `source`.
    pub fn internal(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Internal {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Tags a validation error with the batch position it came from.
    /// Other variants pass through unchanged.
    #[must_use]
    pub fn at_index(self, index: usize) -> Self {
        match self {
            Self::Validation { message, .. } => Self::Validation {
                index: Some(index),
                message: format!("event[{index}]: {message}"),
            },
            other => other,
        }
    }

    /// Whether retrying with a freshly allocated sequence may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short machine-readable code for this error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::NotFound(_) => "not_found",
            Self::SequenceExhausted { .. } => "sequence_exhausted",
            Self::Immutable(_) => "immutable_event",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal_error",
        }
    }
}
