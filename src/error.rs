//! Error taxonomy for the graph engine.
//!
//! Two families with very different handling policies:
//! - `SlotNotReady` is a *recoverable* runtime condition. Diamond-shaped
//!   graphs have no cross-slot transaction guarantee, so a consumer can
//!   observe a half-configured operator mid-update. Callers retry or skip.
//! - Level/type mismatches are graph-construction mistakes. They surface
//!   at `connect()`/`set_value()` time and are not meant to be caught.
//!
//! Cancellation travels as `GraphError::Cancelled` so an execute chain can
//! unwind with `?`, but requests route it to the cancelled channel, never
//! the failed one.

use thiserror::Error;

use crate::roi::Roi;
use crate::value::Dtype;

/// Errors produced by slots, operators, and requests.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Slot has no resolvable value yet. Recoverable: the caller may retry
    /// once the upstream configuration settles.
    #[error("slot '{operator}.{slot}' isn't ready yet; is it connected?")]
    SlotNotReady { operator: String, slot: String },

    /// Connecting slots of different levels (no implicit wrapper creation).
    #[error("can't connect slots: '{from}' has level {from_level}, but '{to}' has level {to_level}")]
    LevelMismatch {
        from: String,
        from_level: usize,
        to: String,
        to_level: usize,
    },

    /// Value does not satisfy the slot's semantic type, or an operation
    /// was applied to the wrong kind of slot (e.g. `resize` on level 0).
    #[error("type mismatch on slot '{slot}': {reason}")]
    TypeMismatch { slot: String, reason: String },

    /// Dtype disagreement between a buffer and the data written into it.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DtypeMismatch { expected: Dtype, actual: Dtype },

    /// Requested region exceeds the slot's declared shape.
    #[error("roi {roi} out of bounds for shape {shape:?}")]
    RoiOutOfBounds { roi: Roi, shape: Vec<usize> },

    /// A value-constraint hook rejected a proposed value. Surfaced to the
    /// direct caller of `set_value` for display to the user.
    #[error("constraint violated on slot '{slot}': {message}")]
    Constraint { slot: String, message: String },

    /// The request observed its cancellation token. Not a failure: request
    /// machinery delivers this through the cancelled channel.
    #[error("request was cancelled")]
    Cancelled,

    /// An operator's `execute()` failed with a domain-specific message.
    #[error("{0}")]
    Execution(String),
}

impl GraphError {
    /// Shorthand for the not-ready condition.
    pub fn not_ready(operator: &str, slot: &str) -> Self {
        GraphError::SlotNotReady {
            operator: operator.to_string(),
            slot: slot.to_string(),
        }
    }

    /// True for the recoverable mid-update race (see module docs).
    pub fn is_not_ready(&self) -> bool {
        matches!(self, GraphError::SlotNotReady { .. })
    }

    /// True when this error is a cooperative-cancellation unwind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GraphError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_classification() {
        let e = GraphError::not_ready("OpAdd", "Input");
        assert!(e.is_not_ready());
        assert!(!e.is_cancelled());
        assert!(e.to_string().contains("OpAdd.Input"));
    }

    #[test]
    fn test_cancelled_is_not_failure_class() {
        let e = GraphError::Cancelled;
        assert!(e.is_cancelled());
        assert!(!e.is_not_ready());
    }
}
