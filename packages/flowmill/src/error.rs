//! Structured error types for engine operations.
//!
//! `EngineError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Only `NotFound` and `InvalidState` surface to API
//! callers; handler failures are internalised on the affected row and
//! never propagate out of an engine operation.
//!
//! `anyhow` remains the transport inside stores and handlers. No
//! `anyhow::Error` ever crosses the event-bus boundary.

use thiserror::Error;
use uuid::Uuid;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Pattern-matchable error for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lookup by id of a nonexistent record.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind ("job", "timer", "batch", "batch part", "subscription").
        kind: &'static str,
        /// The id that missed.
        id: Uuid,
    },

    /// Operation disallowed by the record's state machine.
    #[error("invalid state for {kind} {id}: {reason}")]
    InvalidState {
        /// Record kind.
        kind: &'static str,
        /// The record id.
        id: Uuid,
        /// What was attempted and why it is disallowed.
        reason: String,
    },

    /// No executor registered for a work item's type.
    ///
    /// Internalised by the engines (dead-letter for jobs, failed part for
    /// batches, warning for timers/events); exposed only through the
    /// registry's own lookup API.
    #[error("no executor registered for type {work_type}")]
    HandlerMissing {
        /// The unresolved type string.
        work_type: String,
    },

    /// A timer expression that could not be parsed.
    #[error("invalid timer expression '{expression}': {reason}")]
    Expression {
        /// The raw expression.
        expression: String,
        /// Parse failure detail.
        reason: String,
    },

    /// Storage failure bubbled out of a gateway call.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Shorthand for an `InvalidState` error.
    pub fn invalid_state(kind: &'static str, id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            kind,
            id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_the_record() {
        let id = Uuid::nil();
        let err = EngineError::not_found("job", id);
        assert!(err.to_string().contains("job"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn invalid_state_carries_reason() {
        let err = EngineError::invalid_state("batch", Uuid::nil(), "cannot add parts while running");
        assert!(err.to_string().contains("cannot add parts"));
    }

    #[test]
    fn errors_are_pattern_matchable() {
        let err = EngineError::HandlerMissing {
            work_type: "send_email".into(),
        };
        match err {
            EngineError::HandlerMissing { work_type } => assert_eq!(work_type, "send_email"),
            _ => panic!("expected HandlerMissing"),
        }
    }

    #[test]
    fn store_errors_wrap_anyhow() {
        let err: EngineError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(err.to_string().contains("connection reset"));
    }
}
