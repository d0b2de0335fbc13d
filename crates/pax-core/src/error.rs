//! Engine error taxonomy.
//!
//! Every fallible engine operation returns [`EngineError`]. Failures of
//! optional external collaborators are reported as [`ExternalError`] at the
//! integration seam and are converted into a documented fallback there; they
//! only surface as [`EngineError::ExternalUnavailable`] for collaborators that
//! have no fallback (the vertical registry on a write path).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A vertical (category) slot.
    Vertical,
    /// An auction round.
    Auction,
    /// A bounty pool.
    Pool,
    /// A lease.
    Lease,
}

impl EntityKind {
    /// Returns the string representation used in error messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vertical => "vertical",
            Self::Auction => "auction",
            Self::Pool => "pool",
            Self::Lease => "lease",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of an [`EngineError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed input; never retried.
    Validation,
    /// Unknown entity; never retried.
    NotFound,
    /// The entity is in a state that forbids the operation.
    StateConflict,
    /// A required external collaborator could not be reached.
    ExternalUnavailable,
    /// A concurrent writer won the compare-and-update race.
    ConcurrencyLost,
}

impl ErrorKind {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::StateConflict => "STATE_CONFLICT",
            Self::ExternalUnavailable => "EXTERNAL_UNAVAILABLE",
            Self::ConcurrencyLost => "CONCURRENCY_LOST",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// Input failed validation.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: EntityKind,
        /// The identifier that was not found.
        id: String,
    },

    /// The entity's current state forbids the operation.
    #[error("{kind} {id} state conflict: {reason}")]
    StateConflict {
        /// The entity kind.
        kind: EntityKind,
        /// The entity identifier.
        id: String,
        /// Description of the conflict.
        reason: String,
    },

    /// A required external collaborator failed.
    #[error("external dependency {dependency} unavailable: {source}")]
    ExternalUnavailable {
        /// Name of the collaborator.
        dependency: &'static str,
        /// Underlying failure.
        #[source]
        source: ExternalError,
    },

    /// Another writer committed first.
    #[error("auction {auction_id} was updated concurrently; resubmit with fresh state")]
    ConcurrencyLost {
        /// The contended auction.
        auction_id: String,
    },
}

impl EngineError {
    /// Builds a [`EngineError::Validation`].
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`EngineError::NotFound`].
    #[must_use]
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Builds a [`EngineError::StateConflict`].
    #[must_use]
    pub fn conflict(kind: EntityKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateConflict {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`EngineError::ExternalUnavailable`].
    #[must_use]
    pub const fn external(dependency: &'static str, source: ExternalError) -> Self {
        Self::ExternalUnavailable { dependency, source }
    }

    /// Returns the coarse error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::ExternalUnavailable { .. } => ErrorKind::ExternalUnavailable,
            Self::ConcurrencyLost { .. } => ErrorKind::ConcurrencyLost,
        }
    }

    /// Returns `true` if resubmitting with fresh state may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StateConflict { .. }
                | Self::ExternalUnavailable { .. }
                | Self::ConcurrencyLost { .. }
        )
    }
}

/// Failures reported by external collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExternalError {
    /// The call did not complete before its deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The collaborator is not reachable or returned a transport error.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered but refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}
